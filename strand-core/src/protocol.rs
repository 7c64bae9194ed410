//! Node wire protocol: reserved message types, handshake and bye payloads.

use serde::{Deserialize, Serialize};

use crate::wire::MsgType;

/// Current protocol version. Sent in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Oldest protocol version this build still talks to.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Handshake magic, rejects streams that are not this protocol at all.
pub const MAGIC: [u8; 2] = *b"St";

/// Reserved message types. Application types start at `FIRST_APP_TYPE`.
pub mod msg_type {
    use super::MsgType;

    pub const HANDSHAKE: MsgType = 0;
    pub const BYE: MsgType = 1;
    pub const FIRST_APP_TYPE: MsgType = 2;

    pub fn is_reserved(t: MsgType) -> bool {
        t < FIRST_APP_TYPE
    }
}

/// First message on every connection, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic: [u8; 2],
    pub version: u8,
    pub min_version: u8,
}

impl Handshake {
    pub fn local() -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            min_version: MIN_PROTOCOL_VERSION,
        }
    }

    /// Version both sides speak, or `None` when the ranges are disjoint or
    /// the magic is wrong.
    pub fn negotiate(&self, remote: &Handshake) -> Option<u8> {
        if remote.magic != self.magic || remote.min_version > remote.version {
            return None;
        }
        let version = self.version.min(remote.version);
        if version < self.min_version || version < remote.min_version {
            return None;
        }
        Some(version)
    }
}

/// Graceful close notice. `reason` is application-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    pub reason: u8,
}

/// Encoded size of a `Bye` payload.
pub const BYE_SIZE: usize = 1;

/// Well-known bye reasons.
pub mod bye_reason {
    pub const STOPPING: u8 = 0;
    pub const BAN: u8 = 1;
    pub const LOOPBACK: u8 = 2;
    pub const DUPLICATE: u8 = 3;
    pub const TIMEOUT: u8 = 4;
}
