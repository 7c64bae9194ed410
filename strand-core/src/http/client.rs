//! Host-driven HTTP/1.1 client.
//!
//! The client never opens sockets. It asks the host to connect, send and
//! close through [`ClientAction`]s, and is told about connection events and
//! inbound bytes in return. Time only moves when the host calls
//! [`HttpClient::on_tick`].
//!
//! Requests are served one at a time in submission order. A connection is
//! reused for the next request when the previous response allowed keep-alive
//! and both requests target the same authority.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use super::creator::HttpCreator;
use super::message::{find_header, HttpMessage};
use super::reader::HttpReader;
use crate::error::WireError;
use crate::serializer::SerializedMsg;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unsupported url scheme: {0}")]
    Unsupported(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    /// Method or header would not form a valid request.
    #[error("invalid request")]
    InvalidRequest(#[source] WireError),
    #[error("malformed response")]
    Parse(#[source] WireError),
    #[error("request cancelled")]
    Cancelled,
}

pub type ResponseResult = std::result::Result<HttpMessage, ClientError>;

/// Completion callback, invoked exactly once per accepted request.
pub type ResponseCallback = Box<dyn FnOnce(ResponseResult)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

/// Parsed `http://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Url {
    pub fn parse(url: &str) -> std::result::Result<Url, ClientError> {
        let rest = match url.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => rest,
            Some((scheme, _)) => return Err(ClientError::Unsupported(scheme.to_string())),
            None => return Err(ClientError::InvalidUrl(url.to_string())),
        };
        let (authority, path) = match rest.find(['/', '?']) {
            Some(i) if rest.as_bytes()[i] == b'?' => (&rest[..i], format!("/{}", &rest[i..])),
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/".to_string()),
        };
        let path = match path.split_once('#') {
            Some((p, _)) => p.to_string(),
            None => path,
        };
        let bad = || ClientError::InvalidUrl(url.to_string());
        if url.bytes().any(|b| b.is_ascii_control() || b == b' ') {
            return Err(bad());
        }
        if authority.contains('@') {
            return Err(bad());
        }
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, tail) = v6.split_once(']').ok_or_else(bad)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| bad())?,
                None if tail.is_empty() => 80,
                None => return Err(bad()),
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => (host.to_string(), p.parse().map_err(|_| bad())?),
                None => (authority.to_string(), 80),
            }
        };
        if host.is_empty() {
            return Err(bad());
        }
        Ok(Url { host, port, path })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn host_header(&self) -> String {
        if self.port == 80 {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

/// One request: method, URL, extra headers, optional body and timeout.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

impl ClientRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new("POST", url).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Work the host must perform on the client's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Connect { host: String, port: u16 },
    Send(SerializedMsg),
    Close,
}

enum Conn {
    Idle,
    Connecting(String),
    Connected(String),
}

struct Exchange {
    id: RequestId,
    method: String,
    url: Url,
    message: SerializedMsg,
    deadline: Instant,
    callback: ResponseCallback,
}

pub struct HttpClient {
    queue: VecDeque<Exchange>,
    /// In-flight exchange and whether its request was written.
    active: Option<(Exchange, bool)>,
    conn: Conn,
    reader: HttpReader,
    actions: Vec<ClientAction>,
    next_id: u64,
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            active: None,
            conn: Conn::Idle,
            reader: HttpReader::response(),
            actions: Vec::new(),
            next_id: 1,
        }
    }

    /// Queue a request. `callback` fires once with the response or the error.
    /// URL errors are returned immediately and the callback is dropped.
    pub fn request(
        &mut self,
        req: ClientRequest,
        callback: impl FnOnce(ResponseResult) + 'static,
        now: Instant,
    ) -> std::result::Result<RequestId, ClientError> {
        let url = Url::parse(&req.url)?;
        let mut creator = HttpCreator::request(req.method.as_str(), url.path.as_str());
        if find_header(&req.headers, "Host").is_none() {
            creator = creator.header("Host", url.host_header());
        }
        for (name, value) in req.headers {
            creator = creator.header(name, value);
        }
        if let Some(body) = req.body {
            creator = creator.body(body);
        }

        let message = creator.build().map_err(ClientError::InvalidRequest)?;

        let id = RequestId(self.next_id);
        self.next_id += 1;
        debug!(?id, method = %req.method, url = %req.url, "http request queued");
        self.queue.push_back(Exchange {
            id,
            method: req.method,
            url,
            message,
            deadline: now + req.timeout,
            callback: Box::new(callback),
        });
        self.pump();
        Ok(id)
    }

    /// Drain pending host actions, in order.
    pub fn take_actions(&mut self) -> Vec<ClientAction> {
        std::mem::take(&mut self.actions)
    }

    /// Requests not yet completed, including the in-flight one.
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    pub fn on_connected(&mut self) {
        if let Conn::Connecting(authority) = std::mem::replace(&mut self.conn, Conn::Idle) {
            debug!(%authority, "http connected");
            self.conn = Conn::Connected(authority);
        }
        self.send_active();
    }

    pub fn on_new_data(&mut self, data: &[u8]) {
        trace!(len = data.len(), "http bytes in");
        if !matches!(self.conn, Conn::Connected(_)) {
            // Left over from a connection we already closed.
            debug!(len = data.len(), "http bytes without a connection dropped");
            return;
        }
        if !self.active.as_ref().is_some_and(|(_, sent)| *sent) {
            debug!("unsolicited http bytes; closing");
            self.close_connection();
            return;
        }
        let mut res = self.reader.feed(data);
        loop {
            match res {
                Ok(None) => return,
                // Interim responses carry no final answer.
                Ok(Some(msg)) if msg.status().is_some_and(|s| (100..200).contains(&s)) => {
                    res = self.reader.next_message();
                }
                Ok(Some(msg)) => {
                    if !msg.keep_alive() {
                        self.close_connection();
                    }
                    self.complete(Ok(msg));
                    return;
                }
                Err(e) => {
                    self.close_connection();
                    self.complete(Err(ClientError::Parse(e)));
                    return;
                }
            }
        }
    }

    /// Fail the in-flight request and any expired queued ones whose deadline passed.
    pub fn on_tick(&mut self, now: Instant) {
        if self.active.as_ref().is_some_and(|(ex, _)| now >= ex.deadline) {
            debug!("http request timed out");
            self.close_connection();
            self.complete(Err(ClientError::Timeout));
        }
        let mut i = 0;
        while i < self.queue.len() {
            if now >= self.queue[i].deadline {
                if let Some(ex) = self.queue.remove(i) {
                    (ex.callback)(Err(ClientError::Timeout));
                }
            } else {
                i += 1;
            }
        }
    }

    /// The host's connection went away (peer close or connect failure).
    pub fn on_connection_closed(&mut self) {
        self.conn = Conn::Idle;
        let Some((_, sent)) = self.active.as_ref() else {
            return;
        };
        let result = if *sent {
            match self.reader.on_close() {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => Err(ClientError::Transport(
                    "connection closed before response".into(),
                )),
                Err(e) => Err(ClientError::Parse(e)),
            }
        } else {
            Err(ClientError::Transport("connection failed".into()))
        };
        self.complete(result);
    }

    /// Connection failure with a cause from the host.
    pub fn on_transport_error(&mut self, cause: impl Into<String>) {
        self.conn = Conn::Idle;
        if self.active.is_some() {
            self.complete(Err(ClientError::Transport(cause.into())));
        }
    }

    /// Fail every outstanding request with `Cancelled` and drop the connection.
    pub fn cancel_all(&mut self) {
        if !matches!(self.conn, Conn::Idle) {
            self.close_connection();
        }
        if let Some((ex, _)) = self.active.take() {
            (ex.callback)(Err(ClientError::Cancelled));
        }
        for ex in self.queue.drain(..) {
            (ex.callback)(Err(ClientError::Cancelled));
        }
    }

    fn close_connection(&mut self) {
        self.conn = Conn::Idle;
        self.reader = HttpReader::response();
        self.actions.push(ClientAction::Close);
    }

    fn complete(&mut self, result: ResponseResult) {
        if let Some((ex, _)) = self.active.take() {
            debug!(id = ?ex.id, ok = result.is_ok(), "http request finished");
            (ex.callback)(result);
        }
        self.pump();
    }

    /// Start the next queued exchange when idle.
    fn pump(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(ex) = self.queue.pop_front() else {
            return;
        };
        let authority = ex.url.authority();
        let reusable = matches!(&self.conn, Conn::Connected(a) if *a == authority);
        if !reusable {
            if !matches!(self.conn, Conn::Idle) {
                self.actions.push(ClientAction::Close);
            }
            self.actions.push(ClientAction::Connect {
                host: ex.url.host.clone(),
                port: ex.url.port,
            });
            self.conn = Conn::Connecting(authority);
        }
        self.active = Some((ex, false));
        if reusable {
            self.send_active();
        }
    }

    fn send_active(&mut self) {
        if !matches!(self.conn, Conn::Connected(_)) {
            return;
        }
        if let Some((ex, sent)) = self.active.as_mut() {
            if !*sent {
                *sent = true;
                self.reader = HttpReader::response();
                self.reader.expect_response_to(&ex.method);
                self.actions.push(ClientAction::Send(ex.message.clone()));
            }
        }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Slot = Rc<RefCell<Option<ResponseResult>>>;

    fn slot() -> (Slot, impl FnOnce(ResponseResult)) {
        let s: Slot = Rc::new(RefCell::new(None));
        let s2 = s.clone();
        (s, move |r: ResponseResult| *s2.borrow_mut() = Some(r))
    }

    fn sent_text(actions: &[ClientAction]) -> String {
        actions
            .iter()
            .find_map(|a| match a {
                ClientAction::Send(m) => Some(String::from_utf8(m.to_vec()).unwrap()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn url_parsing() {
        let u = Url::parse("http://example.com:8080/a/b?x=1").unwrap();
        assert_eq!((u.host.as_str(), u.port, u.path.as_str()), ("example.com", 8080, "/a/b?x=1"));
        let u = Url::parse("http://example.com").unwrap();
        assert_eq!((u.port, u.path.as_str()), (80, "/"));
        let u = Url::parse("http://[::1]:9/").unwrap();
        assert_eq!(u.host, "::1");
        assert_eq!(u.authority(), "[::1]:9");
        assert!(matches!(Url::parse("https://x/"), Err(ClientError::Unsupported(_))));
        assert!(matches!(Url::parse("example.com"), Err(ClientError::InvalidUrl(_))));
        assert!(matches!(Url::parse("http://h:port/"), Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn full_exchange() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (got, cb) = slot();
        c.request(ClientRequest::get("http://h:81/x").header("Accept", "*/*"), cb, now)
            .unwrap();
        assert_eq!(
            c.take_actions(),
            vec![ClientAction::Connect { host: "h".into(), port: 81 }]
        );
        c.on_connected();
        let text = sent_text(&c.take_actions());
        assert_eq!(text, "GET /x HTTP/1.1\r\nHost: h:81\r\nAccept: */*\r\n\r\n");

        c.on_new_data(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhell");
        assert!(got.borrow().is_none());
        c.on_new_data(b"o");
        let resp = got.borrow_mut().take().unwrap().unwrap();
        assert_eq!(resp.status(), Some(200));
        assert_eq!(&resp.body[..], b"hello");
        assert_eq!(c.pending(), 0);
        assert!(c.take_actions().is_empty());
    }

    #[test]
    fn timeout_closes_connection() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (got, cb) = slot();
        c.request(
            ClientRequest::get("http://h/").timeout(Duration::from_secs(2)),
            cb,
            now,
        )
        .unwrap();
        c.on_connected();
        c.take_actions();

        c.on_tick(now + Duration::from_secs(1));
        assert!(got.borrow().is_none());
        c.on_tick(now + Duration::from_secs(2));
        assert!(matches!(*got.borrow(), Some(Err(ClientError::Timeout))));
        assert_eq!(c.take_actions(), vec![ClientAction::Close]);
    }

    #[test]
    fn keep_alive_reuses_connection() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (first, cb1) = slot();
        let (second, cb2) = slot();
        c.request(ClientRequest::get("http://h/1"), cb1, now).unwrap();
        c.request(ClientRequest::get("http://h/2"), cb2, now).unwrap();
        c.on_connected();
        assert!(sent_text(&c.take_actions()).starts_with("GET /1 "));

        c.on_new_data(b"HTTP/1.1 204 No Content\r\n\r\n");
        assert!(first.borrow().as_ref().unwrap().is_ok());
        let actions = c.take_actions();
        assert_eq!(actions.len(), 1);
        assert!(sent_text(&actions).starts_with("GET /2 "));

        c.on_new_data(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
        assert!(second.borrow().as_ref().unwrap().is_ok());
        assert_eq!(c.take_actions(), vec![ClientAction::Close]);
    }

    #[test]
    fn other_authority_reconnects() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (_a, cb1) = slot();
        let (_b, cb2) = slot();
        c.request(ClientRequest::get("http://a/"), cb1, now).unwrap();
        c.request(ClientRequest::get("http://b/"), cb2, now).unwrap();
        c.on_connected();
        c.take_actions();
        c.on_new_data(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(
            c.take_actions(),
            vec![
                ClientAction::Close,
                ClientAction::Connect { host: "b".into(), port: 80 }
            ]
        );
    }

    #[test]
    fn body_until_close() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (got, cb) = slot();
        c.request(ClientRequest::get("http://h/"), cb, now).unwrap();
        c.on_connected();
        c.on_new_data(b"HTTP/1.0 200 OK\r\n\r\nall of it");
        assert!(got.borrow().is_none());
        c.on_connection_closed();
        let resp = got.borrow_mut().take().unwrap().unwrap();
        assert_eq!(&resp.body[..], b"all of it");
    }

    #[test]
    fn close_before_response_is_transport_error() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (got, cb) = slot();
        c.request(ClientRequest::get("http://h/"), cb, now).unwrap();
        c.on_connection_closed();
        assert!(matches!(*got.borrow(), Some(Err(ClientError::Transport(_)))));
    }

    #[test]
    fn malformed_response_is_parse_error() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (got, cb) = slot();
        c.request(ClientRequest::post("http://h/", "x"), cb, now).unwrap();
        c.on_connected();
        assert!(sent_text(&c.take_actions()).contains("Content-Length: 1\r\n\r\nx"));
        c.on_new_data(b"NOT HTTP\r\n\r\n");
        assert!(matches!(*got.borrow(), Some(Err(ClientError::Parse(_)))));
        assert_eq!(c.take_actions(), vec![ClientAction::Close]);
    }

    #[test]
    fn cancel_all_fails_everything() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (a, cb1) = slot();
        let (b, cb2) = slot();
        c.request(ClientRequest::get("http://h/"), cb1, now).unwrap();
        c.request(ClientRequest::get("http://h/"), cb2, now).unwrap();
        c.take_actions();
        c.cancel_all();
        assert!(matches!(*a.borrow(), Some(Err(ClientError::Cancelled))));
        assert!(matches!(*b.borrow(), Some(Err(ClientError::Cancelled))));
        assert_eq!(c.take_actions(), vec![ClientAction::Close]);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn late_bytes_after_timeout_do_not_reach_next_request() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (a, cb1) = slot();
        let (b, cb2) = slot();
        c.request(
            ClientRequest::get("http://a/").timeout(Duration::from_secs(1)),
            cb1,
            now,
        )
        .unwrap();
        c.request(ClientRequest::get("http://b/"), cb2, now).unwrap();
        c.on_connected();
        c.take_actions();
        c.on_new_data(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nst");

        c.on_tick(now + Duration::from_secs(1));
        assert!(matches!(*a.borrow(), Some(Err(ClientError::Timeout))));
        assert_eq!(
            c.take_actions(),
            vec![
                ClientAction::Close,
                ClientAction::Connect { host: "b".into(), port: 80 }
            ]
        );

        c.on_new_data(b"ale");
        assert!(b.borrow().is_none());
        c.on_connected();
        assert!(sent_text(&c.take_actions()).starts_with("GET / "));
        c.on_new_data(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfresh");
        let resp = b.borrow_mut().take().unwrap().unwrap();
        assert_eq!(&resp.body[..], b"fresh");
    }

    #[test]
    fn close_mid_body_keeps_parse_cause() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let (got, cb) = slot();
        c.request(ClientRequest::get("http://h/"), cb, now).unwrap();
        c.on_connected();
        c.on_new_data(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        c.on_connection_closed();
        match &*got.borrow() {
            Some(Err(e @ ClientError::Parse(_))) => {
                assert!(std::error::Error::source(e).is_some());
            }
            other => panic!("unexpected {:?}", other.as_ref().map(|r| r.is_ok())),
        };
    }

    #[test]
    fn line_breaks_in_request_rejected() {
        let now = Instant::now();
        let mut c = HttpClient::new();
        let res = c.request(
            ClientRequest::get("http://h/").header("X-A", "1\r\nX-Evil: 1"),
            |_| {},
            now,
        );
        assert!(matches!(res, Err(ClientError::InvalidRequest(_))));
        let res = c.request(ClientRequest::get("http://h/a\r\nX-Evil: 1"), |_| {}, now);
        assert!(matches!(res, Err(ClientError::InvalidUrl(_))));
        assert_eq!(c.pending(), 0);
        assert!(c.take_actions().is_empty());
    }
}
