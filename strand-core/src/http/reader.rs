//! Incremental HTTP/1.x reader on top of `httparse`.
//!
//! Same discipline as the frame reader: bytes are buffered, and a call that
//! cannot complete a message returns `Ok(None)` rather than an error. Bodies
//! are framed by `Content-Length`, chunked transfer coding, or (responses
//! only) the connection closing.

use bytes::BytesMut;

use super::message::{find_header, HttpMessage, StartLine};
use crate::error::{Result, WireError};

/// Most headers accepted in one message.
pub const MAX_HEADERS: usize = 64;

/// Largest accepted start-line + header block.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Default body ceiling (16 MiB).
pub const DEFAULT_MAX_BODY: usize = 16 * 1024 * 1024;

/// Longest chunk-size line we wait for before giving up.
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy)]
enum Chunk {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    Length(usize),
    Chunked(Chunk),
    UntilClose,
}

enum State {
    Head,
    Body {
        start: StartLine,
        headers: Vec<(String, String)>,
        framing: Framing,
    },
    Failed,
}

/// Reader for one direction of an HTTP connection.
pub struct HttpReader {
    kind: MessageKind,
    buffer: BytesMut,
    body: BytesMut,
    state: State,
    max_body: usize,
    /// Method of the request this response answers; HEAD responses carry no body.
    request_method: Option<String>,
}

impl HttpReader {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            buffer: BytesMut::with_capacity(8 * 1024),
            body: BytesMut::new(),
            state: State::Head,
            max_body: DEFAULT_MAX_BODY,
            request_method: None,
        }
    }

    pub fn request() -> Self {
        Self::new(MessageKind::Request)
    }

    pub fn response() -> Self {
        Self::new(MessageKind::Response)
    }

    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Tell a response reader which method the answered request used.
    pub fn expect_response_to(&mut self, method: &str) {
        self.request_method = Some(method.to_ascii_uppercase());
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    /// True while a body is being read until the connection closes.
    pub fn reads_until_close(&self) -> bool {
        matches!(
            self.state,
            State::Body {
                framing: Framing::UntilClose,
                ..
            }
        )
    }

    /// Buffer `data` and return the next complete message, if any.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<HttpMessage>> {
        if !self.is_failed() {
            self.buffer.extend_from_slice(data);
        }
        self.next_message()
    }

    /// Return the next complete message from already buffered bytes
    /// (pipelined messages).
    pub fn next_message(&mut self) -> Result<Option<HttpMessage>> {
        let res = self.advance();
        if res.is_err() {
            self.state = State::Failed;
            self.buffer.clear();
            self.body.clear();
        }
        res
    }

    /// The peer closed the connection. Completes a read-until-close body;
    /// anything else half-read is an error.
    pub fn on_close(&mut self) -> Result<Option<HttpMessage>> {
        match std::mem::replace(&mut self.state, State::Head) {
            State::Body {
                start,
                headers,
                framing: Framing::UntilClose,
            } => {
                let body = std::mem::take(&mut self.body).freeze();
                Ok(Some(HttpMessage {
                    start,
                    headers,
                    body,
                }))
            }
            State::Head if self.buffer.is_empty() => Ok(None),
            State::Failed => {
                self.state = State::Failed;
                Ok(None)
            }
            _ => {
                self.state = State::Failed;
                Err(WireError::http("connection closed mid-message"))
            }
        }
    }

    fn advance(&mut self) -> Result<Option<HttpMessage>> {
        loop {
            match self.state {
                State::Failed => return Ok(None),
                State::Head => {
                    let (consumed, start, headers) = match parse_head(self.kind, &self.buffer)? {
                        Some(head) => head,
                        None => {
                            if self.buffer.len() > MAX_HEAD_SIZE {
                                return Err(WireError::http("header block too large"));
                            }
                            return Ok(None);
                        }
                    };
                    let _ = self.buffer.split_to(consumed);
                    let framing = self.body_framing(&start, &headers)?;
                    if let Framing::Length(n) = framing {
                        if n > self.max_body {
                            return Err(WireError::http(format!(
                                "body of {} bytes exceeds {}",
                                n, self.max_body
                            )));
                        }
                    }
                    self.body.clear();
                    self.state = State::Body {
                        start,
                        headers,
                        framing,
                    };
                }
                State::Body { .. } => {
                    let done = match &mut self.state {
                        State::Body { framing, .. } => {
                            read_body(framing, &mut self.buffer, &mut self.body, self.max_body)?
                        }
                        _ => false,
                    };
                    if !done {
                        return Ok(None);
                    }
                    if let State::Body { start, headers, .. } =
                        std::mem::replace(&mut self.state, State::Head)
                    {
                        let body = std::mem::take(&mut self.body).freeze();
                        return Ok(Some(HttpMessage {
                            start,
                            headers,
                            body,
                        }));
                    }
                }
            }
        }
    }

    fn body_framing(&self, start: &StartLine, headers: &[(String, String)]) -> Result<Framing> {
        if let StartLine::Response { status, .. } = start {
            let head_request = self.request_method.as_deref() == Some("HEAD");
            if head_request || (100..200).contains(status) || *status == 204 || *status == 304 {
                return Ok(Framing::Length(0));
            }
        }
        if let Some(te) = find_header(headers, "Transfer-Encoding") {
            let last = te.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(Framing::Chunked(Chunk::Size));
            }
            if self.kind == MessageKind::Request {
                return Err(WireError::http("request transfer-encoding without chunked"));
            }
            return Ok(Framing::UntilClose);
        }
        if let Some(len) = content_length(headers)? {
            return Ok(Framing::Length(len));
        }
        match self.kind {
            MessageKind::Request => Ok(Framing::Length(0)),
            MessageKind::Response => Ok(Framing::UntilClose),
        }
    }
}

/// Parse start line + headers. `Ok(None)` when the head is incomplete.
fn parse_head(
    kind: MessageKind,
    buf: &[u8],
) -> Result<Option<(usize, StartLine, Vec<(String, String)>)>> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match kind {
        MessageKind::Request => {
            let mut req = httparse::Request::new(&mut raw);
            let consumed = match req.parse(buf)? {
                httparse::Status::Complete(n) => n,
                httparse::Status::Partial => return Ok(None),
            };
            let start = StartLine::Request {
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or_default().to_string(),
                version: req.version.unwrap_or(1),
            };
            Ok(Some((consumed, start, owned_headers(req.headers)?)))
        }
        MessageKind::Response => {
            let mut res = httparse::Response::new(&mut raw);
            let consumed = match res.parse(buf)? {
                httparse::Status::Complete(n) => n,
                httparse::Status::Partial => return Ok(None),
            };
            let start = StartLine::Response {
                version: res.version.unwrap_or(1),
                status: res.code.unwrap_or_default(),
                reason: res.reason.unwrap_or_default().to_string(),
            };
            Ok(Some((consumed, start, owned_headers(res.headers)?)))
        }
    }
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Result<Vec<(String, String)>> {
    headers
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| WireError::http(format!("header {} is not utf-8", h.name)))?;
            Ok((h.name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>> {
    let mut found: Option<usize> = None;
    for (_, v) in headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
    {
        let len: usize = v
            .trim()
            .parse()
            .map_err(|_| WireError::http(format!("invalid content-length {:?}", v)))?;
        if found.is_some_and(|prev| prev != len) {
            return Err(WireError::http("conflicting content-length headers"));
        }
        found = Some(len);
    }
    Ok(found)
}

/// Move buffered bytes into `body`. Returns `true` when the body is complete.
fn read_body(
    framing: &mut Framing,
    buffer: &mut BytesMut,
    body: &mut BytesMut,
    max_body: usize,
) -> Result<bool> {
    match framing {
        Framing::Length(remaining) => {
            let n = (*remaining).min(buffer.len());
            body.extend_from_slice(&buffer.split_to(n));
            *remaining -= n;
            Ok(*remaining == 0)
        }
        Framing::UntilClose => {
            if body.len() + buffer.len() > max_body {
                return Err(WireError::http("body too large"));
            }
            body.extend_from_slice(&buffer.split());
            Ok(false)
        }
        Framing::Chunked(chunk) => decode_chunked(chunk, buffer, body, max_body),
    }
}

/// Advance a chunked body. Returns `true` once the last chunk and trailers
/// have been consumed.
fn decode_chunked(
    chunk: &mut Chunk,
    buffer: &mut BytesMut,
    body: &mut BytesMut,
    max_body: usize,
) -> Result<bool> {
    loop {
        match chunk {
            Chunk::Size => match httparse::parse_chunk_size(&buffer[..]) {
                Ok(httparse::Status::Complete((consumed, size))) => {
                    let _ = buffer.split_to(consumed);
                    let size = usize::try_from(size)
                        .map_err(|_| WireError::http("chunk size overflow"))?;
                    if body.len().saturating_add(size) > max_body {
                        return Err(WireError::http("chunked body too large"));
                    }
                    *chunk = if size == 0 {
                        Chunk::Trailers
                    } else {
                        Chunk::Data(size)
                    };
                }
                Ok(httparse::Status::Partial) => {
                    if buffer.len() > MAX_CHUNK_LINE {
                        return Err(WireError::http("chunk size line too long"));
                    }
                    return Ok(false);
                }
                Err(_) => return Err(WireError::http("invalid chunk size")),
            },
            Chunk::Data(remaining) => {
                let n = (*remaining).min(buffer.len());
                body.extend_from_slice(&buffer.split_to(n));
                *remaining -= n;
                if *remaining > 0 {
                    return Ok(false);
                }
                *chunk = Chunk::DataEnd;
            }
            Chunk::DataEnd => {
                if buffer.len() < 2 {
                    return Ok(false);
                }
                if &buffer[..2] != b"\r\n" {
                    return Err(WireError::http("missing CRLF after chunk data"));
                }
                let _ = buffer.split_to(2);
                *chunk = Chunk::Size;
            }
            Chunk::Trailers => {
                let pos = match buffer.windows(2).position(|w| w == b"\r\n") {
                    Some(pos) => pos,
                    None => {
                        if buffer.len() > MAX_HEAD_SIZE {
                            return Err(WireError::http("trailers too large"));
                        }
                        return Ok(false);
                    }
                };
                let _ = buffer.split_to(pos + 2);
                if pos == 0 {
                    return Ok(true);
                }
            }
        }
    }
}
