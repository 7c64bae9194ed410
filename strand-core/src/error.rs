//! Error taxonomy shared by the framing, protocol and HTTP layers.

/// Errors raised by the transport core.
///
/// Framing and parse errors are connection-fatal: the owner tears down the
/// affected connection and never resynchronizes the stream.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Incoming frame (or line) declares more bytes than the configured ceiling.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    /// Outgoing payload does not fit the length field or the configured ceiling.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    /// Bad handshake, bad sequencing, or a payload outside its size limits.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("http parse error: {0}")]
    HttpParse(String),
    #[error("timed out")]
    Timeout,
    /// Underlying connection failure reported by the host.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cancelled")]
    Cancelled,
    /// Payload (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl WireError {
    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        WireError::ProtocolViolation(msg.into())
    }

    pub(crate) fn http(msg: impl Into<String>) -> Self {
        WireError::HttpParse(msg.into())
    }
}

impl From<httparse::Error> for WireError {
    fn from(e: httparse::Error) -> Self {
        WireError::HttpParse(e.to_string())
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, WireError>;
