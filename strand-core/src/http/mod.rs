//! HTTP/1.x framing: incremental reader, ordered-header creator and a
//! host-driven client built from the two.

pub mod client;
pub mod creator;
pub mod message;
pub mod reader;

pub use client::{ClientAction, ClientError, ClientRequest, HttpClient, RequestId, Url};
pub use creator::HttpCreator;
pub use message::{HttpMessage, StartLine};
pub use reader::{HttpReader, MessageKind};
