//! Host-driven protocol base: one instance per connection.
//!
//! The host reports connection events and inbound bytes; the base negotiates
//! the protocol version, dispatches decoded messages to the handlers
//! registered for their type, and queues outgoing fragments for the host to
//! write. Nothing here blocks or performs I/O.
//!
//! Lifecycle: `Unconnected -> Negotiating -> Active -> Closed`. Any framing or
//! dispatch failure goes straight to `Closed`; a corrupted stream is never
//! resynchronized.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{Result, WireError};
use crate::protocol::{msg_type, Bye, Handshake, BYE_SIZE};
use crate::queue::{Outbox, WriteQueue};
use crate::reader::MessageReader;
use crate::serializer::MessageSerializer;
use crate::wire::{Message, MsgType, DEFAULT_MAX_MESSAGE_SIZE};

/// Receives decoded messages of the type(s) it is registered for.
///
/// Returning `Err` tears the connection down.
pub trait Handler {
    fn on_message(&mut self, msg: Message, out: &mut Outbox) -> Result<()>;
}

impl<F> Handler for F
where
    F: FnMut(Message, &mut Outbox) -> Result<()>,
{
    fn on_message(&mut self, msg: Message, out: &mut Outbox) -> Result<()> {
        self(msg, out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Negotiating,
    Active,
    Closed,
}

/// Why a connection ended. Recorded once, on the transition to `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Framing, handshake or dispatch rule broken by the peer.
    Protocol(String),
    /// A handler returned an error.
    Handler(String),
    /// Peer said goodbye.
    Bye(u8),
    /// Host reported the transport gone.
    Transport(String),
    /// We closed it (sent Bye).
    Local,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Protocol(e) => write!(f, "protocol: {}", e),
            DisconnectReason::Handler(e) => write!(f, "handler: {}", e),
            DisconnectReason::Bye(r) => write!(f, "bye {}", r),
            DisconnectReason::Transport(e) => write!(f, "transport: {}", e),
            DisconnectReason::Local => write!(f, "closed locally"),
        }
    }
}

struct HandlerEntry {
    handler: Box<dyn Handler>,
    min_size: usize,
    max_size: usize,
}

/// Protocol state for one connection.
pub struct ProtocolBase {
    state: ConnectionState,
    local: Handshake,
    negotiated_version: Option<u8>,
    reader: MessageReader,
    outbox: Outbox,
    handlers: HashMap<MsgType, HandlerEntry>,
    default_handler: Option<Box<dyn Handler>>,
    close_reason: Option<DisconnectReason>,
}

impl ProtocolBase {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: u32) -> Self {
        let serializer = MessageSerializer::with_limits(
            max_message_size,
            crate::serializer::DEFAULT_FRAGMENT_SIZE,
        );
        Self {
            state: ConnectionState::Unconnected,
            local: Handshake::local(),
            negotiated_version: None,
            reader: MessageReader::with_max_message_size(max_message_size),
            outbox: Outbox::new(serializer),
            handlers: HashMap::new(),
            default_handler: None,
            close_reason: None,
        }
    }

    /// Override the advertised handshake (version range).
    pub fn set_local_handshake(&mut self, local: Handshake) {
        self.local = local;
    }

    /// Register `handler` for `t`. A later registration for the same type
    /// replaces the earlier one; returns `true` when that happened.
    pub fn register_handler(&mut self, t: MsgType, handler: impl Handler + 'static) -> Result<bool> {
        self.register_handler_with_limits(t, 0, usize::MAX, handler)
    }

    /// Like `register_handler`, with payloads outside `[min_size, max_size]`
    /// treated as a protocol violation.
    pub fn register_handler_with_limits(
        &mut self,
        t: MsgType,
        min_size: usize,
        max_size: usize,
        handler: impl Handler + 'static,
    ) -> Result<bool> {
        if msg_type::is_reserved(t) {
            return Err(WireError::violation(format!(
                "message type {} is reserved",
                t
            )));
        }
        let entry = HandlerEntry {
            handler: Box::new(handler),
            min_size,
            max_size,
        };
        let replaced = self.handlers.insert(t, entry).is_some();
        if replaced {
            debug!(msg_type = t, "handler replaced");
        }
        Ok(replaced)
    }

    /// Route unregistered types here instead of failing the connection.
    pub fn set_default_handler(&mut self, handler: impl Handler + 'static) {
        self.default_handler = Some(Box::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn negotiated_version(&self) -> Option<u8> {
        self.negotiated_version
    }

    pub fn close_reason(&self) -> Option<&DisconnectReason> {
        self.close_reason.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Transport is up: queue our handshake and start negotiating.
    pub fn on_connected(&mut self) -> Result<()> {
        if self.state != ConnectionState::Unconnected {
            return Err(WireError::violation("connection already started"));
        }
        self.outbox.send_control(msg_type::HANDSHAKE, &self.local)?;
        self.state = ConnectionState::Negotiating;
        debug!(version = self.local.version, "handshake queued");
        Ok(())
    }

    /// Feed inbound bytes and dispatch every message they complete, in order.
    ///
    /// The call that hits a terminal error returns it; from then on the
    /// connection is `Closed` and input is ignored.
    pub fn on_new_data(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Unconnected => {
                let err = WireError::violation("data before connect");
                self.close(DisconnectReason::Protocol(err.to_string()));
                return Err(err);
            }
            _ => {}
        }
        trace!(len = data.len(), "inbound bytes");
        self.reader.push(data);

        while self.state != ConnectionState::Closed {
            let msg = match self.reader.next_message() {
                None => break,
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    self.close(DisconnectReason::Protocol(e.to_string()));
                    return Err(e);
                }
            };
            if let Err(e) = self.dispatch(msg) {
                let reason = match e {
                    HandlerFailure::Protocol(ref e) => DisconnectReason::Protocol(e.to_string()),
                    HandlerFailure::Handler(ref e) => DisconnectReason::Handler(e.to_string()),
                };
                self.close(reason);
                return Err(e.into_inner());
            }
        }
        Ok(())
    }

    /// Queue an application message with a bincode payload.
    pub fn send<T: Serialize + ?Sized>(&mut self, t: MsgType, payload: &T) -> Result<()> {
        self.check_open()?;
        self.outbox.send(t, payload)
    }

    /// Queue an application message with a pre-encoded payload.
    pub fn send_raw(&mut self, t: MsgType, payload: impl Into<Bytes>) -> Result<()> {
        self.check_open()?;
        self.outbox.send_raw(t, payload)
    }

    /// Queue a Bye and close. The host should still flush `take_outgoing()`.
    pub fn send_bye(&mut self, reason: u8) -> Result<()> {
        self.check_open()?;
        self.outbox.send_control(msg_type::BYE, &Bye { reason })?;
        self.close(DisconnectReason::Local);
        Ok(())
    }

    /// Host saw the transport close (or fail). Drops buffered input and any
    /// unsent output; no handler fires after this.
    pub fn on_connection_closed(&mut self) {
        self.close(DisconnectReason::Transport("connection closed".to_string()));
        self.outbox.queue_mut().clear();
    }

    /// Drain queued outgoing fragments for the host to write.
    pub fn take_outgoing(&mut self) -> Vec<Bytes> {
        self.outbox.queue_mut().drain()
    }

    pub fn write_queue(&self) -> &WriteQueue {
        self.outbox.queue()
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Negotiating | ConnectionState::Active => Ok(()),
            _ => Err(WireError::violation("connection is not open")),
        }
    }

    fn close(&mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        match &reason {
            DisconnectReason::Protocol(_) | DisconnectReason::Handler(_) => {
                warn!(%reason, "connection failed")
            }
            _ => debug!(%reason, "connection closed"),
        }
        self.state = ConnectionState::Closed;
        self.close_reason = Some(reason);
        self.reader.reset();
    }

    fn dispatch(&mut self, msg: Message) -> std::result::Result<(), HandlerFailure> {
        match self.state {
            ConnectionState::Negotiating => self.on_handshake(msg).map_err(HandlerFailure::Protocol),
            ConnectionState::Active => self.on_active_message(msg),
            _ => Ok(()),
        }
    }

    fn on_handshake(&mut self, msg: Message) -> Result<()> {
        if msg.msg_type != msg_type::HANDSHAKE {
            return Err(WireError::violation(format!(
                "expected handshake, got message type {}",
                msg.msg_type
            )));
        }
        let remote: Handshake = bincode::deserialize(&msg.payload)
            .map_err(|_| WireError::violation("malformed handshake"))?;
        let version = self.local.negotiate(&remote).ok_or_else(|| {
            WireError::violation(format!(
                "incompatible peer versions {}..={}",
                remote.min_version, remote.version
            ))
        })?;
        self.negotiated_version = Some(version);
        self.state = ConnectionState::Active;
        debug!(version, "protocol negotiated");
        Ok(())
    }

    fn on_active_message(&mut self, msg: Message) -> std::result::Result<(), HandlerFailure> {
        match msg.msg_type {
            msg_type::HANDSHAKE => Err(HandlerFailure::Protocol(WireError::violation(
                "duplicate handshake",
            ))),
            msg_type::BYE => {
                let bye: Bye = match bincode::deserialize(&msg.payload) {
                    Ok(bye) if msg.payload.len() == BYE_SIZE => bye,
                    _ => {
                        return Err(HandlerFailure::Protocol(WireError::violation(
                            "malformed bye",
                        )))
                    }
                };
                self.close(DisconnectReason::Bye(bye.reason));
                Ok(())
            }
            t => {
                if let Some(entry) = self.handlers.get_mut(&t) {
                    let len = msg.payload.len();
                    if len < entry.min_size || len > entry.max_size {
                        return Err(HandlerFailure::Protocol(WireError::violation(format!(
                            "message type {} payload of {} bytes outside {}..={}",
                            t, len, entry.min_size, entry.max_size
                        ))));
                    }
                    entry
                        .handler
                        .on_message(msg, &mut self.outbox)
                        .map_err(HandlerFailure::Handler)
                } else if let Some(handler) = self.default_handler.as_mut() {
                    handler
                        .on_message(msg, &mut self.outbox)
                        .map_err(HandlerFailure::Handler)
                } else {
                    Err(HandlerFailure::Protocol(WireError::UnknownMessageType(t)))
                }
            }
        }
    }
}

impl Default for ProtocolBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch failure, split by who is to blame.
enum HandlerFailure {
    Protocol(WireError),
    Handler(WireError),
}

impl HandlerFailure {
    fn into_inner(self) -> WireError {
        match self {
            HandlerFailure::Protocol(e) | HandlerFailure::Handler(e) => e,
        }
    }
}
