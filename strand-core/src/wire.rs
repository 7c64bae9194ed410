//! Framing: 1-byte message type + 4-byte LE length + payload.
//!
//! ```text
//! ┌──────────┬───────────┬─────────────────┐
//! │ msg_type │ length    │ payload         │
//! │ u8       │ u32 LE    │ `length` bytes  │
//! └──────────┴───────────┴─────────────────┘
//! ```
//!
//! All multi-byte integers in the library are little-endian. There is no
//! checksum at this layer.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 5;

/// Default ceiling on a frame payload (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Message type tag.
pub type MsgType = u8;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MsgType,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(msg_type: MsgType, length: u32) -> Self {
        Self { msg_type, length }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.msg_type;
        buf[1..5].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Decode a header from the front of `buf`. Returns `None` if fewer than
    /// `HEADER_SIZE` bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            msg_type: buf[0],
            length: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
        })
    }
}

/// One complete frame: type tag and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub payload: Bytes,
}

impl Message {
    pub fn new(msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Decode a payload written by `MessageSerializer::encode`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}
