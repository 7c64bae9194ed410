//! Stratum mining-pool client: JSON-RPC over newline-delimited text.

pub mod error;
pub mod messages;
pub mod session;

pub use error::{StratumError, StratumResult};
pub use messages::{Job, JsonRpcMessage, SubmitParams};
pub use session::{SessionState, StratumSession};
