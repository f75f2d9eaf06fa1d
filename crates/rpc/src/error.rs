//! Error types for framing, decoding and request correlation.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::message::ResponseError;

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum CodecError {
	/// Input/output error on the underlying channel.
	#[error("{0}")]
	Io(#[from] io::Error),
	/// A `Content-Length` framed message arrived without the header.
	#[error("missing Content-Length header")]
	MissingContentLength,
	/// A header line could not be parsed.
	#[error("invalid header: {0}")]
	InvalidHeader(String),
	/// The peer announced or sent a frame over the size limit.
	#[error("frame of {length} bytes exceeds the {limit} byte limit")]
	FrameTooLarge {
		/// Announced or observed length.
		length: usize,
		/// The limit in force.
		limit: usize,
	},
}

/// Errors raised while turning a frame into a [`crate::Message`].
#[derive(Debug, Error)]
pub enum DecodeError {
	/// The frame is not valid JSON.
	#[error("invalid JSON: {0}")]
	Json(#[from] serde_json::Error),
	/// The JSON is well-formed but is not a JSON-RPC envelope.
	#[error("not a JSON-RPC envelope: {0}")]
	Shape(&'static str),
}

/// Reasons an outbound request can fail to produce a result.
///
/// Every pending request ends with exactly one of `Ok(result)` or one of these.
#[derive(Debug, Clone, Error)]
pub enum CallError {
	/// No response arrived before the deadline.
	#[error("request `{method}` timed out after {timeout:?}")]
	Timeout {
		/// Method of the request that timed out.
		method: String,
		/// The deadline that elapsed.
		timeout: Duration,
	},
	/// The worker behind the channel exited or the channel broke mid-flight.
	#[error("worker crashed")]
	WorkerCrashed,
	/// The channel was closed on purpose before the request completed.
	#[error("channel closed")]
	ChannelClosed,
	/// The peer answered with something that could not be interpreted.
	#[error("malformed response: {0}")]
	MalformedResponse(String),
	/// The peer answered with a JSON-RPC error object.
	#[error("{0}")]
	Response(#[from] ResponseError),
}

impl From<DecodeError> for CallError {
	fn from(err: DecodeError) -> Self {
		Self::MalformedResponse(err.to_string())
	}
}
