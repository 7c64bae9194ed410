//! Strand transport core.
//! Host-driven: no I/O; host passes events and bytes, drains outgoing fragments.

pub mod core;
pub mod error;
pub mod http;
pub mod line;
pub mod protocol;
pub mod queue;
pub mod reader;
pub mod serializer;
pub mod stratum;
pub mod wire;

pub use self::core::{ConnectionState, DisconnectReason, Handler, ProtocolBase};
pub use error::{Result, WireError};
pub use line::LineReader;
pub use protocol::{Bye, Handshake, PROTOCOL_VERSION};
pub use queue::{Outbox, WriteQueue};
pub use reader::{MessageReader, Messages};
pub use serializer::{MessageSerializer, SerializedMsg};
pub use wire::{FrameHeader, Message, MsgType, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};
