//! Stratum client session over newline-delimited JSON.
//!
//! Like `ProtocolBase`, the session performs no I/O: the host feeds received
//! bytes to [`StratumSession::on_new_data`] and writes whatever
//! [`StratumSession::take_outgoing`] returns.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use super::error::{StratumError, StratumResult};
use super::messages::{describe_error, parse_subscribe_result, Job, JsonRpcMessage, SubmitParams};
use crate::line::LineReader;
use crate::queue::WriteQueue;
use crate::serializer::SerializedMsg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Subscribing,
    Subscribed,
    Authorizing,
    Ready,
    Closed,
}

impl SessionState {
    /// Until both subscribe and authorize succeed, anything unreadable is fatal.
    fn in_handshake(self) -> bool {
        !matches!(self, SessionState::Ready | SessionState::Closed)
    }
}

/// Callback for one request, resolved with the pool's `result` value.
pub type ReplyCallback = Box<dyn FnOnce(StratumResult<Value>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Subscribe,
    Authorize,
    Submit,
}

struct PendingRequest {
    kind: RequestKind,
    callback: ReplyCallback,
}

pub struct StratumSession {
    state: SessionState,
    lines: LineReader,
    out: WriteQueue,
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    on_job: Option<Box<dyn FnMut(&Job)>>,
    current_job: Option<Job>,
    worker: Option<String>,
    /// Authorize reply arrived; may precede the subscribe reply.
    authorized: bool,
    difficulty: Option<f64>,
    extranonce1: Vec<u8>,
    extranonce2_size: usize,
}

impl StratumSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            lines: LineReader::new(),
            out: WriteQueue::new(),
            next_id: 1,
            pending: HashMap::new(),
            on_job: None,
            current_job: None,
            worker: None,
            authorized: false,
            difficulty: None,
            extranonce1: Vec::new(),
            extranonce2_size: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_job(&self) -> Option<&Job> {
        self.current_job.as_ref()
    }

    pub fn difficulty(&self) -> Option<f64> {
        self.difficulty
    }

    pub fn extranonce1(&self) -> &[u8] {
        &self.extranonce1
    }

    pub fn extranonce2_size(&self) -> usize {
        self.extranonce2_size
    }

    /// Requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Called for every valid `mining.notify`, in arrival order.
    pub fn on_job(&mut self, f: impl FnMut(&Job) + 'static) {
        self.on_job = Some(Box::new(f));
    }

    pub fn subscribe(
        &mut self,
        user_agent: &str,
        callback: impl FnOnce(StratumResult<Value>) + 'static,
    ) -> StratumResult<u64> {
        if self.state != SessionState::Connecting {
            return Err(StratumError::NotReady(self.state));
        }
        let id = self.request(RequestKind::Subscribe, "mining.subscribe", json!([user_agent]), callback)?;
        self.state = SessionState::Subscribing;
        Ok(id)
    }

    /// Allowed once subscribe was sent; pools accept the two pipelined.
    pub fn authorize(
        &mut self,
        user: &str,
        password: &str,
        callback: impl FnOnce(StratumResult<Value>) + 'static,
    ) -> StratumResult<u64> {
        if !matches!(self.state, SessionState::Subscribing | SessionState::Subscribed) {
            return Err(StratumError::NotReady(self.state));
        }
        let id = self.request(
            RequestKind::Authorize,
            "mining.authorize",
            json!([user, password]),
            callback,
        )?;
        self.worker = Some(user.to_string());
        if self.state == SessionState::Subscribed {
            self.state = SessionState::Authorizing;
        }
        Ok(id)
    }

    /// Submit a share. Fails locally, without writing, unless `Ready`.
    pub fn submit_share(
        &mut self,
        share: &SubmitParams,
        callback: impl FnOnce(StratumResult<Value>) + 'static,
    ) -> StratumResult<u64> {
        let worker = match (&self.worker, self.state) {
            (Some(worker), SessionState::Ready) => worker.clone(),
            _ => return Err(StratumError::NotReady(self.state)),
        };
        debug!(job_id = %share.job_id, "submitting share");
        self.request(
            RequestKind::Submit,
            "mining.submit",
            share.to_stratum_json(&worker),
            callback,
        )
    }

    /// Feed received bytes. An `Err` is terminal: the session is `Closed`
    /// and the host should drop the connection.
    pub fn on_new_data(&mut self, data: &[u8]) -> StratumResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let lines: Vec<_> = self.lines.feed(data).collect();
        for line in lines {
            if self.state == SessionState::Closed {
                break;
            }
            let res = match line {
                Ok(line) => self.on_line(&line),
                Err(e) => Err(StratumError::Transport(e)),
            };
            if let Err(e) = res {
                warn!(error = %e, "stratum session failed");
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Connection went away: fail everything pending with `Cancelled`.
    pub fn on_connection_closed(&mut self) {
        if self.state != SessionState::Closed {
            debug!("stratum connection closed");
        }
        self.close();
    }

    /// Lines to write, in order.
    pub fn take_outgoing(&mut self) -> Vec<Bytes> {
        self.out.drain()
    }

    fn request(
        &mut self,
        kind: RequestKind,
        method: &str,
        params: Value,
        callback: impl FnOnce(StratumResult<Value>) + 'static,
    ) -> StratumResult<u64> {
        let id = self.next_id;
        let mut line = serde_json::to_vec(&JsonRpcMessage::request(id, method, params))?;
        line.push(b'\n');
        self.next_id += 1;
        trace!(id, method, "stratum request");
        self.out
            .push(SerializedMsg::from_fragments(vec![Bytes::from(line)]));
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                callback: Box::new(callback),
            },
        );
        Ok(id)
    }

    fn on_line(&mut self, line: &[u8]) -> StratumResult<()> {
        let msg: JsonRpcMessage = match serde_json::from_slice(line) {
            Ok(msg) => msg,
            Err(e) if self.state.in_handshake() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, line = %String::from_utf8_lossy(line), "malformed stratum line dropped");
                return Ok(());
            }
        };
        match msg {
            JsonRpcMessage::Response { id, result, error } => self.on_response(id, result, error),
            JsonRpcMessage::Request {
                id: None,
                method,
                params,
            } => {
                self.on_notification(&method, &params);
                Ok(())
            }
            JsonRpcMessage::Request {
                id: Some(id),
                method,
                ..
            } => {
                warn!(id, %method, "pool request not supported; dropped");
                Ok(())
            }
        }
    }

    fn on_response(
        &mut self,
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
    ) -> StratumResult<()> {
        let Some(pending) = self.pending.remove(&id) else {
            warn!(id, "response for unknown request id dropped");
            return Ok(());
        };
        let outcome = match (error, result) {
            (Some(err), _) => Err(describe_error(&err)),
            (None, Some(Value::Bool(false))) => Err("rejected".to_string()),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        match pending.kind {
            RequestKind::Subscribe => {
                let parsed = outcome
                    .clone()
                    .and_then(|r| parse_subscribe_result(&r));
                match parsed {
                    Ok((extranonce1, size)) => {
                        debug!(extranonce1 = %hex::encode(&extranonce1), size, "subscribed");
                        self.extranonce1 = extranonce1;
                        self.extranonce2_size = size;
                        if self.state == SessionState::Subscribing {
                            self.state = if self.authorized {
                                debug!("ready");
                                SessionState::Ready
                            } else if self.worker.is_some() {
                                SessionState::Authorizing
                            } else {
                                SessionState::Subscribed
                            };
                        }
                        (pending.callback)(outcome.map_err(StratumError::Pool));
                        Ok(())
                    }
                    Err(reason) => {
                        (pending.callback)(Err(StratumError::Pool(reason.clone())));
                        Err(StratumError::SubscriptionFailed(reason))
                    }
                }
            }
            RequestKind::Authorize => match outcome {
                Ok(result) => {
                    debug!("authorized");
                    self.authorized = true;
                    // Ready needs the subscribe reply too.
                    if self.state == SessionState::Authorizing {
                        self.state = SessionState::Ready;
                    }
                    (pending.callback)(Ok(result));
                    Ok(())
                }
                Err(reason) => {
                    (pending.callback)(Err(StratumError::Pool(reason.clone())));
                    Err(StratumError::AuthorizationFailed(reason))
                }
            },
            RequestKind::Submit => {
                if let Err(reason) = &outcome {
                    debug!(%reason, "share rejected");
                }
                (pending.callback)(outcome.map_err(StratumError::Pool));
                Ok(())
            }
        }
    }

    fn on_notification(&mut self, method: &str, params: &Value) {
        match method {
            "mining.notify" => match Job::from_stratum_params(params) {
                Ok(job) => {
                    debug!(job_id = %job.job_id, clean = job.clean_jobs, "new job");
                    if let Some(f) = self.on_job.as_mut() {
                        f(&job);
                    }
                    self.current_job = Some(job);
                }
                Err(e) => warn!(error = %e, "bad mining.notify dropped"),
            },
            "mining.set_difficulty" => match params.get(0).and_then(Value::as_f64) {
                Some(d) => {
                    debug!(difficulty = d, "difficulty changed");
                    self.difficulty = Some(d);
                }
                None => warn!(%params, "bad mining.set_difficulty dropped"),
            },
            "mining.set_extranonce" => {
                let en1 = params
                    .get(0)
                    .and_then(Value::as_str)
                    .and_then(|s| hex::decode(s).ok());
                let size = params.get(1).and_then(Value::as_u64);
                match (en1, size) {
                    (Some(en1), Some(size)) => {
                        self.extranonce1 = en1;
                        self.extranonce2_size = size as usize;
                    }
                    _ => warn!(%params, "bad mining.set_extranonce dropped"),
                }
            }
            other => warn!(method = other, "unknown notification dropped"),
        }
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        self.lines.reset();
        self.out.clear();
        for (_, p) in self.pending.drain() {
            (p.callback)(Err(StratumError::Cancelled));
        }
    }
}

impl Default for StratumSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Slot = Rc<RefCell<Option<StratumResult<Value>>>>;

    fn slot() -> (Slot, impl FnOnce(StratumResult<Value>)) {
        let s: Slot = Rc::new(RefCell::new(None));
        let s2 = s.clone();
        (s, move |r: StratumResult<Value>| *s2.borrow_mut() = Some(r))
    }

    fn outgoing(s: &mut StratumSession) -> Vec<Value> {
        s.take_outgoing()
            .iter()
            .map(|line| {
                assert_eq!(line.last(), Some(&b'\n'));
                serde_json::from_slice(line).unwrap()
            })
            .collect()
    }

    const SUBSCRIBED: &[u8] =
        b"{\"id\":1,\"result\":[[[\"mining.notify\",\"x\"]],\"08000002\",4],\"error\":null}\n";

    fn ready_session() -> StratumSession {
        let mut s = StratumSession::new();
        s.subscribe("strand/0.1", |_| {}).unwrap();
        s.authorize("worker", "x", |_| {}).unwrap();
        s.on_new_data(SUBSCRIBED).unwrap();
        s.on_new_data(b"{\"id\":2,\"result\":true,\"error\":null}\n")
            .unwrap();
        s.take_outgoing();
        s
    }

    fn share() -> SubmitParams {
        SubmitParams {
            job_id: "j1".into(),
            extranonce2: vec![0, 0, 0, 1],
            ntime: 0x5a5a_5a5a,
            nonce: 0xdead_beef,
        }
    }

    #[test]
    fn handshake_to_ready() {
        let mut s = StratumSession::new();
        let (sub, cb) = slot();
        s.subscribe("strand/0.1", cb).unwrap();
        assert_eq!(s.state(), SessionState::Subscribing);
        assert_eq!(
            outgoing(&mut s),
            vec![json!({"id": 1, "method": "mining.subscribe", "params": ["strand/0.1"]})]
        );

        s.on_new_data(SUBSCRIBED).unwrap();
        assert_eq!(s.state(), SessionState::Subscribed);
        assert!(sub.borrow().as_ref().unwrap().is_ok());
        assert_eq!(s.extranonce1(), &[8, 0, 0, 2]);
        assert_eq!(s.extranonce2_size(), 4);

        let (auth, cb) = slot();
        s.authorize("worker", "pw", cb).unwrap();
        assert_eq!(s.state(), SessionState::Authorizing);
        s.on_new_data(b"{\"id\":2,\"result\":true,\"error\":null}\n")
            .unwrap();
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(*auth.borrow().as_ref().unwrap().as_ref().unwrap(), json!(true));
    }

    #[test]
    fn submit_before_ready_writes_nothing() {
        let mut s = StratumSession::new();
        s.subscribe("a", |_| {}).unwrap();
        s.take_outgoing();
        let res = s.submit_share(&share(), |_| {});
        assert!(matches!(res, Err(StratumError::NotReady(SessionState::Subscribing))));
        assert!(s.take_outgoing().is_empty());
        assert_eq!(s.pending(), 1);
    }

    #[test]
    fn mismatched_id_leaves_callback_pending() {
        let mut s = StratumSession::new();
        s.subscribe("a", |_| {}).unwrap();
        s.on_new_data(SUBSCRIBED).unwrap();
        let (auth, cb) = slot();
        s.authorize("w", "x", cb).unwrap();
        s.on_new_data(b"{\"id\":99,\"result\":true,\"error\":null}\n")
            .unwrap();
        assert!(auth.borrow().is_none());
        assert_eq!(s.state(), SessionState::Authorizing);
        assert_eq!(s.pending(), 1);
    }

    #[test]
    fn malformed_line_fatal_during_handshake() {
        let mut s = StratumSession::new();
        let (sub, cb) = slot();
        s.subscribe("a", cb).unwrap();
        assert!(matches!(s.on_new_data(b"{not json\n"), Err(StratumError::Json(_))));
        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(*sub.borrow(), Some(Err(StratumError::Cancelled))));
    }

    #[test]
    fn malformed_line_fatal_between_subscribe_and_authorize() {
        let mut s = StratumSession::new();
        s.subscribe("a", |_| {}).unwrap();
        s.on_new_data(SUBSCRIBED).unwrap();
        assert_eq!(s.state(), SessionState::Subscribed);
        assert!(matches!(s.on_new_data(b"{garbage\n"), Err(StratumError::Json(_))));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn authorize_reply_before_subscribe_reply() {
        let mut s = StratumSession::new();
        let (auth, cb) = slot();
        s.subscribe("a", |_| {}).unwrap();
        s.authorize("worker", "x", cb).unwrap();
        s.take_outgoing();

        s.on_new_data(b"{\"id\":2,\"result\":true,\"error\":null}\n")
            .unwrap();
        assert!(auth.borrow().as_ref().unwrap().is_ok());
        assert_eq!(s.state(), SessionState::Subscribing);
        assert!(matches!(
            s.submit_share(&share(), |_| {}),
            Err(StratumError::NotReady(SessionState::Subscribing))
        ));
        assert!(s.take_outgoing().is_empty());

        s.on_new_data(SUBSCRIBED).unwrap();
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(s.extranonce1(), &[8, 0, 0, 2]);
        assert!(s.submit_share(&share(), |_| {}).is_ok());
    }

    #[test]
    fn malformed_line_dropped_when_ready() {
        let mut s = ready_session();
        s.on_new_data(b"garbage\n{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[1024]}\n")
            .unwrap();
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(s.difficulty(), Some(1024.0));
    }

    #[test]
    fn jobs_reach_callback() {
        let mut s = ready_session();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        s.on_job(move |job: &Job| seen2.borrow_mut().push(job.job_id.clone()));
        let notify = json!({
            "id": null,
            "method": "mining.notify",
            "params": ["j7", "00".repeat(32), "aa", "bb", [], "20000000", "1d00ffff", "5a5a5a5a", true]
        });
        let mut line = serde_json::to_vec(&notify).unwrap();
        line.push(b'\n');
        // split mid-line
        s.on_new_data(&line[..10]).unwrap();
        assert!(seen.borrow().is_empty());
        s.on_new_data(&line[10..]).unwrap();
        assert_eq!(*seen.borrow(), vec!["j7".to_string()]);
        assert!(s.current_job().unwrap().clean_jobs);
    }

    #[test]
    fn share_accept_and_reject() {
        let mut s = ready_session();
        let (ok, cb) = slot();
        let id = s.submit_share(&share(), cb).unwrap();
        assert_eq!(
            outgoing(&mut s),
            vec![json!({
                "id": id,
                "method": "mining.submit",
                "params": ["worker", "j1", "00000001", "5a5a5a5a", "deadbeef"]
            })]
        );
        s.on_new_data(format!("{{\"id\":{},\"result\":true,\"error\":null}}\n", id).as_bytes())
            .unwrap();
        assert!(ok.borrow().as_ref().unwrap().is_ok());

        let (rejected, cb) = slot();
        let id = s.submit_share(&share(), cb).unwrap();
        s.on_new_data(
            format!(
                "{{\"id\":{},\"result\":null,\"error\":[23,\"Low difficulty share\",null]}}\n",
                id
            )
            .as_bytes(),
        )
        .unwrap();
        match &*rejected.borrow() {
            Some(Err(StratumError::Pool(reason))) => assert!(reason.contains("Low difficulty")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.state(), SessionState::Ready);
    }

    #[test]
    fn authorization_rejected_is_fatal() {
        let mut s = StratumSession::new();
        s.subscribe("a", |_| {}).unwrap();
        s.on_new_data(SUBSCRIBED).unwrap();
        let (auth, cb) = slot();
        s.authorize("w", "bad", cb).unwrap();
        let res = s.on_new_data(b"{\"id\":2,\"result\":false,\"error\":null}\n");
        assert!(matches!(res, Err(StratumError::AuthorizationFailed(_))));
        assert!(matches!(*auth.borrow(), Some(Err(StratumError::Pool(_)))));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn close_cancels_pending() {
        let mut s = ready_session();
        let (a, cb1) = slot();
        let (b, cb2) = slot();
        s.submit_share(&share(), cb1).unwrap();
        s.submit_share(&share(), cb2).unwrap();
        s.on_connection_closed();
        assert!(matches!(*a.borrow(), Some(Err(StratumError::Cancelled))));
        assert!(matches!(*b.borrow(), Some(Err(StratumError::Cancelled))));
        assert!(s.take_outgoing().is_empty());
        assert!(matches!(
            s.submit_share(&share(), |_| {}),
            Err(StratumError::NotReady(SessionState::Closed))
        ));
    }
}
