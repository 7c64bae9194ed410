//! Stratum error types.

use thiserror::Error;

use super::session::SessionState;
use crate::error::WireError;

#[derive(Error, Debug)]
pub enum StratumError {
    /// Operation not allowed in the current session state. Nothing was written.
    #[error("session not ready ({0:?})")]
    NotReady(SessionState),

    /// The pool answered with an error or rejected the request.
    #[error("pool error: {0}")]
    Pool(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Line framing failure below the JSON layer.
    #[error("transport error")]
    Transport(#[from] WireError),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// The connection closed while the request was pending.
    #[error("cancelled")]
    Cancelled,
}

pub type StratumResult<T> = Result<T, StratumError>;
