//! JSON-RPC plumbing for talking to language-analysis workers.
//!
//! This crate turns one duplex byte channel into awaitable request/response
//! pairs:
//! * [`Message`]: the decoded envelope, a tagged union of request, response and notification
//! * [`codec`]: `Content-Length` and newline framing
//! * [`RequestCorrelator`]: id allocation, pending-request bookkeeping and timeouts
//! * [`Connection`]: reader/writer tasks that serialize writes and route responses

#![warn(missing_docs)]

pub mod codec;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod message;

pub use codec::Framing;
pub use connection::Connection;
pub use correlator::{PendingResponse, RequestCorrelator};
pub use error::{CallError, CodecError, DecodeError};
pub use message::{AnyNotification, AnyRequest, AnyResponse, ErrorCode, Message, RequestId, ResponseError};
pub use serde_json::Value as JsonValue;
