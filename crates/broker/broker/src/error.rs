//! Broker error types.

use thiserror::Error;
use wharf_rpc::CallError;

use crate::config::ConfigError;

/// Result alias for broker operations.
pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

/// Failures inside the broker.
///
/// None of these reach the editor: the session facade turns every one of them
/// into the empty result for the operation and logs it.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
	/// Every slot is busy and no waiter was admitted before the deadline.
	#[error("worker pool exhausted")]
	PoolExhausted,
	/// The worker process could not be started.
	#[error("failed to spawn `{command}`: {reason}")]
	SpawnFailed {
		/// Program that was launched.
		command: String,
		/// OS error text.
		reason: String,
	},
	/// The worker exited while a request was in flight.
	#[error("worker crashed")]
	WorkerCrashed,
	/// No response before the deadline.
	#[error("request `{method}` timed out")]
	Timeout {
		/// Method of the request.
		method: String,
	},
	/// The worker answered with something that could not be read.
	#[error("malformed response: {0}")]
	MalformedResponse(String),
	/// The worker answered with a JSON-RPC error.
	#[error("worker error: {0}")]
	Rpc(CallError),
	/// The session was torn down while the operation was waiting.
	#[error("session closed")]
	SessionClosed,
	/// The pool has shut down.
	#[error("broker shutting down")]
	Shutdown,
	/// A document URI could not be understood.
	#[error("invalid document uri `{0}`")]
	InvalidUri(String),
	/// Configuration could not be loaded.
	#[error("config: {0}")]
	Config(String),
}

impl From<CallError> for BrokerError {
	fn from(err: CallError) -> Self {
		match err {
			CallError::Timeout { method, .. } => Self::Timeout { method },
			CallError::WorkerCrashed | CallError::ChannelClosed => Self::WorkerCrashed,
			CallError::MalformedResponse(detail) => Self::MalformedResponse(detail),
			other @ CallError::Response(_) => Self::Rpc(other),
		}
	}
}

impl From<ConfigError> for BrokerError {
	fn from(err: ConfigError) -> Self {
		Self::Config(err.to_string())
	}
}

impl From<serde_json::Error> for BrokerError {
	fn from(err: serde_json::Error) -> Self {
		Self::MalformedResponse(err.to_string())
	}
}

impl BrokerError {
	/// Whether this failure is routine enough to log at `debug`.
	pub fn is_routine(&self) -> bool {
		matches!(self, Self::Timeout { .. } | Self::PoolExhausted | Self::SessionClosed | Self::Shutdown)
	}
}
