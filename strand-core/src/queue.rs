//! Outgoing write queue and the handler-facing send handle.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::Serialize;

use crate::error::{Result, WireError};
use crate::protocol::msg_type;
use crate::serializer::{MessageSerializer, SerializedMsg};
use crate::wire::MsgType;

/// FIFO of whole messages. Fragments of one message are always drained
/// together, never interleaved with another message's.
#[derive(Debug, Default)]
pub struct WriteQueue {
    messages: VecDeque<SerializedMsg>,
    bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: SerializedMsg) {
        self.bytes += msg.len();
        self.messages.push_back(msg);
    }

    pub fn pop_message(&mut self) -> Option<SerializedMsg> {
        let msg = self.messages.pop_front()?;
        self.bytes -= msg.len();
        Some(msg)
    }

    /// Take every queued fragment, in order.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.bytes = 0;
        self.messages
            .drain(..)
            .flat_map(SerializedMsg::into_fragments)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Queued bytes across all messages.
    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.bytes = 0;
    }
}

/// Send handle given to message handlers; replies land on the connection's
/// write queue behind everything already queued.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: WriteQueue,
    serializer: MessageSerializer,
}

impl Outbox {
    pub fn new(serializer: MessageSerializer) -> Self {
        Self {
            queue: WriteQueue::new(),
            serializer,
        }
    }

    /// Queue an application message with a bincode payload.
    pub fn send<T: Serialize + ?Sized>(&mut self, t: MsgType, payload: &T) -> Result<()> {
        check_app_type(t)?;
        let msg = self.serializer.encode(t, payload)?;
        self.queue.push(msg);
        Ok(())
    }

    /// Queue an application message with a pre-encoded payload.
    pub fn send_raw(&mut self, t: MsgType, payload: impl Into<Bytes>) -> Result<()> {
        check_app_type(t)?;
        let msg = self.serializer.encode_raw(t, payload)?;
        self.queue.push(msg);
        Ok(())
    }

    pub(crate) fn send_control<T: Serialize>(&mut self, t: MsgType, payload: &T) -> Result<()> {
        let msg = self.serializer.encode(t, payload)?;
        self.queue.push(msg);
        Ok(())
    }

    pub(crate) fn queue_mut(&mut self) -> &mut WriteQueue {
        &mut self.queue
    }

    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }
}

fn check_app_type(t: MsgType) -> Result<()> {
    if msg_type::is_reserved(t) {
        return Err(WireError::violation(format!(
            "message type {} is reserved",
            t
        )));
    }
    Ok(())
}
