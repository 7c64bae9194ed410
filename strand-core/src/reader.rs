//! Message reader: rebuilds frames from an arbitrarily fragmented byte stream.
//!
//! State machine:
//! - `WaitingForHeader`: need `HEADER_SIZE` bytes
//! - `WaitingForPayload`: header decoded, need `remaining` payload bytes
//!
//! `feed` only buffers; frames are cut out lazily while the returned
//! iterator is driven. A frame that declares more than the configured maximum
//! fails the reader for good: the buffer is dropped and later input ignored.

use bytes::BytesMut;

use crate::error::{Result, WireError};
use crate::wire::{FrameHeader, Message, MsgType, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { msg_type: MsgType, remaining: usize },
}

/// Per-connection frame reassembly buffer.
pub struct MessageReader {
    buffer: BytesMut,
    state: State,
    max_message_size: u32,
    failed: bool,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForHeader,
            max_message_size,
            failed: false,
        }
    }

    /// Append newly arrived bytes and return the messages they complete.
    ///
    /// The iterator is finite: it ends as soon as the buffer holds no complete
    /// frame. It yields at most one `Err`, after which the reader is failed.
    pub fn feed(&mut self, data: &[u8]) -> Messages<'_> {
        self.push(data);
        Messages { reader: self }
    }

    /// Buffer bytes without decoding anything yet.
    pub fn push(&mut self, data: &[u8]) {
        if !self.failed && !data.is_empty() {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Decode the next buffered message, if one is complete.
    pub fn next_message(&mut self) -> Option<Result<Message>> {
        self.try_extract_one().transpose()
    }

    /// True once a framing violation has been seen.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered state and clear the failure flag.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
        self.failed = false;
    }

    fn try_extract_one(&mut self) -> Result<Option<Message>> {
        if self.failed {
            return Ok(None);
        }
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let header = match FrameHeader::decode(&self.buffer) {
                        Some(h) => h,
                        None => return Ok(None),
                    };
                    if header.length > self.max_message_size {
                        self.failed = true;
                        self.buffer.clear();
                        return Err(WireError::FrameTooLarge {
                            size: header.length as usize,
                            max: self.max_message_size as usize,
                        });
                    }
                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForPayload {
                        msg_type: header.msg_type,
                        remaining: header.length as usize,
                    };
                }
                State::WaitingForPayload {
                    msg_type,
                    remaining,
                } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Message { msg_type, payload }));
                }
            }
        }
    }
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy sequence of messages completed by one `feed` call.
pub struct Messages<'a> {
    reader: &'a mut MessageReader,
}

impl Iterator for Messages<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::MessageSerializer;
    use rand::Rng;

    fn frame(msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
        MessageSerializer::new()
            .encode_raw(msg_type, payload.to_vec())
            .unwrap()
            .to_vec()
    }

    fn collect(reader: &mut MessageReader, data: &[u8]) -> Vec<Message> {
        reader.feed(data).collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn roundtrip_single() {
        let mut reader = MessageReader::new();
        let msgs = collect(&mut reader, &frame(7, b"payload"));
        assert_eq!(msgs, vec![Message::new(7, &b"payload"[..])]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn zero_length_delivered_immediately() {
        let mut reader = MessageReader::new();
        let msgs = collect(&mut reader, &frame(3, b""));
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].payload.is_empty());
    }

    #[test]
    fn empty_feed_is_noop() {
        let mut reader = MessageReader::new();
        assert!(collect(&mut reader, &[]).is_empty());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn partial_header_waits() {
        let mut reader = MessageReader::new();
        let bytes = frame(2, b"abc");
        assert!(collect(&mut reader, &bytes[..HEADER_SIZE - 1]).is_empty());
        let msgs = collect(&mut reader, &bytes[HEADER_SIZE - 1..]);
        assert_eq!(msgs, vec![Message::new(2, &b"abc"[..])]);
    }

    #[test]
    fn several_messages_in_one_feed() {
        let mut reader = MessageReader::new();
        let mut data = frame(2, b"one");
        data.extend(frame(3, b""));
        data.extend(frame(4, b"three"));
        let types: Vec<MsgType> = collect(&mut reader, &data)
            .iter()
            .map(|m| m.msg_type)
            .collect();
        assert_eq!(types, vec![2, 3, 4]);
    }

    #[test]
    fn byte_at_a_time_matches_single_chunk() {
        let mut data = Vec::new();
        for i in 0..5u8 {
            data.extend(frame(i + 2, &vec![i; i as usize * 3]));
        }
        let whole = collect(&mut MessageReader::new(), &data);

        let mut reader = MessageReader::new();
        let mut pieces = Vec::new();
        for b in &data {
            pieces.extend(collect(&mut reader, &[*b]));
        }
        assert_eq!(pieces, whole);
        assert_eq!(whole.len(), 5);
    }

    #[test]
    fn random_chunking_matches_single_chunk() {
        let mut rng = rand::thread_rng();
        let mut data = Vec::new();
        for i in 0..20u8 {
            let len = rng.gen_range(0..300);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            data.extend(frame(i, &payload));
        }
        let whole = collect(&mut MessageReader::new(), &data);

        for _ in 0..10 {
            let mut reader = MessageReader::new();
            let mut out = Vec::new();
            let mut pos = 0;
            while pos < data.len() {
                let n = rng.gen_range(1..=17).min(data.len() - pos);
                out.extend(collect(&mut reader, &data[pos..pos + n]));
                pos += n;
            }
            assert_eq!(out, whole);
        }
    }

    #[test]
    fn oversized_frame_fails_reader_for_good() {
        let mut reader = MessageReader::with_max_message_size(10);
        let mut data = FrameHeader::new(2, 11).encode().to_vec();
        data.extend(frame(2, b"ok"));

        let results: Vec<_> = reader.feed(&data).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(WireError::FrameTooLarge { size: 11, max: 10 })
        ));
        assert!(reader.is_failed());

        assert!(reader.feed(&frame(2, b"ok")).next().is_none());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn frame_at_exact_limit_accepted() {
        let mut reader = MessageReader::with_max_message_size(10);
        let msgs = collect(&mut reader, &frame(2, &[9u8; 10]));
        assert_eq!(msgs, vec![Message::new(2, vec![9u8; 10])]);
        assert!(!reader.is_failed());
    }

    #[test]
    fn dropped_iterator_resumes_on_next_feed() {
        let mut reader = MessageReader::new();
        let mut data = frame(2, b"a");
        data.extend(frame(3, b"b"));
        let first = reader.feed(&data).next().unwrap().unwrap();
        assert_eq!(first.msg_type, 2);
        let rest = collect(&mut reader, &[]);
        assert_eq!(rest, vec![Message::new(3, &b"b"[..])]);
    }
}
