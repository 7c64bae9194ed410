//! Message serializer: type tag + payload into wire-ready fragments.
//!
//! The output is a list of `Bytes` suitable for a vectored write. The first
//! fragment is always the frame header; the payload follows in slices of at
//! most `fragment_size` bytes. Splitting is a view over one buffer, so it
//! costs no copies.

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::error::{Result, WireError};
use crate::wire::{FrameHeader, MsgType, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};

/// Default payload fragment size for scatter writes.
pub const DEFAULT_FRAGMENT_SIZE: usize = 20_000;

/// One logical outgoing message as an ordered list of fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedMsg {
    fragments: Vec<Bytes>,
}

impl SerializedMsg {
    pub fn from_fragments(fragments: Vec<Bytes>) -> Self {
        Self { fragments }
    }

    pub fn fragments(&self) -> &[Bytes] {
        &self.fragments
    }

    pub fn into_fragments(self) -> Vec<Bytes> {
        self.fragments
    }

    /// Total size in bytes across all fragments.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenate fragments. Meant for tests and small control messages.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for f in &self.fragments {
            out.extend_from_slice(f);
        }
        out
    }
}

/// Encodes typed payloads into framed messages. Pure: never touches the network.
#[derive(Debug, Clone, Copy)]
pub struct MessageSerializer {
    max_message_size: u32,
    fragment_size: usize,
}

impl MessageSerializer {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }

    pub fn with_limits(max_message_size: u32, fragment_size: usize) -> Self {
        Self {
            max_message_size,
            fragment_size: fragment_size.max(1),
        }
    }

    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    /// Encode `value` with bincode (fixed-width, little-endian) under `msg_type`.
    pub fn encode<T: Serialize + ?Sized>(&self, msg_type: MsgType, value: &T) -> Result<SerializedMsg> {
        let payload = bincode::serialize(value)?;
        self.encode_raw(msg_type, payload)
    }

    /// Frame an already-encoded payload.
    pub fn encode_raw(&self, msg_type: MsgType, payload: impl Into<Bytes>) -> Result<SerializedMsg> {
        let payload: Bytes = payload.into();
        let len = u32::try_from(payload.len()).map_err(|_| WireError::MessageTooLarge {
            size: payload.len(),
            max: self.max_message_size as usize,
        })?;
        if len > self.max_message_size {
            return Err(WireError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size as usize,
            });
        }

        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&FrameHeader::new(msg_type, len).encode());

        let mut fragments = Vec::with_capacity(1 + payload.len() / self.fragment_size + 1);
        fragments.push(header.freeze());
        let mut rest = payload;
        while !rest.is_empty() {
            let n = rest.len().min(self.fragment_size);
            fragments.push(rest.split_to(n));
        }
        Ok(SerializedMsg::from_fragments(fragments))
    }
}

impl Default for MessageSerializer {
    fn default() -> Self {
        Self::new()
    }
}
