//! HTTP/1.1 message builder. Output is a `SerializedMsg` so HTTP writes go
//! through the same write queue as framed messages.

use std::fmt::Write as _;

use bytes::Bytes;

use super::message::find_header;
use crate::error::{Result, WireError};
use crate::serializer::SerializedMsg;

/// CR or LF in a start-line token or header would split the message.
fn check_field(what: &str, value: &str) -> Result<()> {
    if value.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(WireError::http(format!("line break in {}: {:?}", what, value)));
    }
    Ok(())
}

enum Start {
    Request { method: String, target: String },
    Response { status: u16, reason: String },
}

enum Body {
    None,
    Fixed(Bytes),
    Chunked(Vec<Bytes>),
}

/// Builds one request or response. Headers are written in insertion order.
pub struct HttpCreator {
    start: Start,
    headers: Vec<(String, String)>,
    body: Body,
}

impl HttpCreator {
    pub fn request(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            start: Start::Request {
                method: method.into(),
                target: target.into(),
            },
            headers: Vec::new(),
            body: Body::None,
        }
    }

    pub fn response(status: u16, reason: impl Into<String>) -> Self {
        Self {
            start: Start::Response {
                status,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: Body::None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Fixed body. `Content-Length` is added unless already set.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Fixed(body.into());
        self
    }

    /// Body sent with chunked transfer coding, one chunk per element.
    pub fn chunked_body(mut self, chunks: impl IntoIterator<Item = Bytes>) -> Self {
        self.body = Body::Chunked(chunks.into_iter().collect());
        self
    }

    /// Fails if any start-line token or header contains CR or LF.
    pub fn build(self) -> Result<SerializedMsg> {
        match &self.start {
            Start::Request { method, target } => {
                check_field("method", method)?;
                check_field("request target", target)?;
            }
            Start::Response { reason, .. } => check_field("reason", reason)?,
        }
        for (name, value) in &self.headers {
            check_field("header name", name)?;
            check_field("header value", value)?;
        }

        let mut head = String::with_capacity(256);
        // Writing into a String cannot fail.
        let _ = match &self.start {
            Start::Request { method, target } => write!(head, "{} {} HTTP/1.1\r\n", method, target),
            Start::Response { status, reason } => write!(head, "HTTP/1.1 {} {}\r\n", status, reason),
        };
        for (name, value) in &self.headers {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        let has_length = find_header(&self.headers, "Content-Length").is_some();
        let has_te = find_header(&self.headers, "Transfer-Encoding").is_some();
        let is_response = matches!(self.start, Start::Response { .. });

        let mut fragments = Vec::new();
        match self.body {
            Body::None => {
                if is_response && !has_length && !has_te {
                    head.push_str("Content-Length: 0\r\n");
                }
                head.push_str("\r\n");
                fragments.push(Bytes::from(head));
            }
            Body::Fixed(body) => {
                if !has_length {
                    let _ = write!(head, "Content-Length: {}\r\n", body.len());
                }
                head.push_str("\r\n");
                fragments.push(Bytes::from(head));
                if !body.is_empty() {
                    fragments.push(body);
                }
            }
            Body::Chunked(chunks) => {
                if !has_te {
                    head.push_str("Transfer-Encoding: chunked\r\n");
                }
                head.push_str("\r\n");
                fragments.push(Bytes::from(head));
                for chunk in chunks.into_iter().filter(|c| !c.is_empty()) {
                    fragments.push(Bytes::from(format!("{:x}\r\n", chunk.len())));
                    fragments.push(chunk);
                    fragments.push(Bytes::from_static(b"\r\n"));
                }
                fragments.push(Bytes::from_static(b"0\r\n\r\n"));
            }
        }
        Ok(SerializedMsg::from_fragments(fragments))
    }
}
