//! Handles to running worker processes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use tokio::sync::{OnceCell, oneshot, watch};
use wharf_rpc::Connection;

use crate::error::{BrokerError, Result};

/// How long [`WorkerHandle::terminate`] waits for the exit monitor.
const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// Stable identifier of one editing session; the pool's admission unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub u64);

impl fmt::Display for SessionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "s{}", self.0)
	}
}

/// Identity of one worker lifetime.
///
/// Generations are allocated pool-wide and never reused, so a report about a
/// replaced worker can never be mistaken for one about its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
	/// Session the worker serves.
	pub session: SessionKey,
	/// Pool-wide generation.
	pub generation: u64,
}

impl fmt::Display for WorkerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "w{}/{}", self.generation, self.session)
	}
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
	/// Spawned, handshake not started.
	Uninitialized,
	/// `initialize` is in flight.
	Initializing,
	/// Handshake complete; requests may be sent.
	Ready,
	/// Exited or asked to exit. Terminal.
	Terminated,
}

/// Channels to the task that owns the OS process.
#[derive(Debug)]
pub struct WorkerControl {
	/// Asks the monitor to shut the process down.
	pub term_tx: oneshot::Sender<()>,
	/// Resolves once the monitor has finished.
	pub done_rx: oneshot::Receiver<()>,
}

#[derive(Debug)]
struct WorkerInner {
	id: WorkerId,
	connection: Arc<Connection>,
	state: watch::Sender<WorkerState>,
	capabilities: OnceCell<JsonValue>,
	control: Mutex<Option<WorkerControl>>,
}

/// Shared handle to one worker. Clones refer to the same process.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
	inner: Arc<WorkerInner>,
}

impl WorkerHandle {
	/// Wrap a running worker's channel.
	///
	/// `control` is `None` for workers without a monitor task; terminating
	/// those only closes the channel.
	pub fn new(id: WorkerId, connection: Arc<Connection>, control: Option<WorkerControl>) -> Self {
		let (state, _) = watch::channel(WorkerState::Uninitialized);
		Self {
			inner: Arc::new(WorkerInner {
				id,
				connection,
				state,
				capabilities: OnceCell::new(),
				control: Mutex::new(control),
			}),
		}
	}

	/// Worker identity.
	pub fn id(&self) -> WorkerId {
		self.inner.id
	}

	/// The duplex channel.
	pub fn connection(&self) -> &Arc<Connection> {
		&self.inner.connection
	}

	/// Current lifecycle state.
	pub fn state(&self) -> WorkerState {
		*self.inner.state.borrow()
	}

	/// Watch lifecycle transitions.
	pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
		self.inner.state.subscribe()
	}

	/// Whether the worker can still take requests.
	pub fn is_alive(&self) -> bool {
		self.state() != WorkerState::Terminated
			&& !self.inner.connection.is_closed()
			&& !self.inner.connection.correlator().is_closed()
	}

	/// Server capabilities, once the handshake has completed.
	pub fn capabilities(&self) -> Option<&JsonValue> {
		self.inner.capabilities.get()
	}

	/// Run the `initialize`/`initialized` handshake exactly once.
	///
	/// Concurrent callers share one handshake. Servers refuse a second
	/// `initialize`, so a failed handshake marks the worker terminated and the
	/// pool replaces it once its last lease is released.
	///
	/// # Errors
	///
	/// Whatever the `initialize` request failed with, or
	/// [`BrokerError::WorkerCrashed`] after a failed handshake.
	pub async fn initialize(&self, params: impl FnOnce() -> JsonValue, timeout: Duration) -> Result<&JsonValue> {
		self.inner
			.capabilities
			.get_or_try_init(|| async {
				if self.state() == WorkerState::Terminated {
					return Err(BrokerError::WorkerCrashed);
				}
				self.transition(WorkerState::Initializing);
				let result = match self.inner.connection.call("initialize", params(), timeout).await {
					Ok(result) => result,
					Err(err) => {
						tracing::warn!(worker = %self.id(), error = %err, "Worker initialize failed; retiring worker");
						self.mark_terminated();
						return Err(BrokerError::from(err));
					}
				};
				self.inner.connection.notify("initialized", json!({}))?;
				self.transition(WorkerState::Ready);
				tracing::info!(worker = %self.id(), "Worker initialized");
				Ok::<_, BrokerError>(result.get("capabilities").cloned().unwrap_or(JsonValue::Null))
			})
			.await
	}

	/// Send a request and wait for its result.
	///
	/// # Errors
	///
	/// The correlator's failure, mapped into [`crate::BrokerError`].
	pub async fn request(&self, method: &str, params: JsonValue, timeout: Duration) -> Result<JsonValue> {
		Ok(self.inner.connection.call(method, params, timeout).await?)
	}

	/// Queue a notification.
	///
	/// # Errors
	///
	/// Fails once the channel is closed.
	pub fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
		Ok(self.inner.connection.notify(method, params)?)
	}

	/// Ask the process to exit and wait for its monitor to finish.
	///
	/// Safe to call more than once and on workers that already exited.
	pub async fn terminate(&self) {
		let control = self.inner.control.lock().take();
		if let Some(WorkerControl { term_tx, done_rx }) = control {
			let _ = term_tx.send(());
			if tokio::time::timeout(TERMINATE_WAIT, done_rx).await.is_err() {
				tracing::warn!(worker = %self.id(), "Worker monitor did not finish in time");
			}
		}
		self.inner.connection.close();
		self.mark_terminated();
	}

	/// Record that the process is gone.
	pub(crate) fn mark_terminated(&self) {
		self.inner.state.send_replace(WorkerState::Terminated);
	}

	/// Move to `next` unless already terminated.
	fn transition(&self, next: WorkerState) {
		self.inner.state.send_if_modified(|state| {
			if *state == WorkerState::Terminated || *state == next {
				return false;
			}
			*state = next;
			true
		});
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::BufReader;
	use wharf_rpc::{AnyResponse, Framing, Message, codec};

	use super::*;

	fn id() -> WorkerId {
		WorkerId {
			session: SessionKey(7),
			generation: 3,
		}
	}

	/// A handle whose peer answers `initialize` once and records everything.
	fn handle_with_peer() -> (WorkerHandle, tokio::task::JoinHandle<Vec<String>>) {
		let (ours, theirs) = tokio::io::duplex(16 * 1024);
		let (r, w) = tokio::io::split(ours);
		let conn = Connection::spawn("test", BufReader::new(r), w, Framing::ContentLength, None);
		let peer = tokio::spawn(async move {
			let (pr, mut pw) = tokio::io::split(theirs);
			let mut pr = BufReader::new(pr);
			let mut buf = Vec::new();
			let mut seen = Vec::new();
			while let Ok(Some(body)) = codec::read_frame(&mut pr, Framing::ContentLength, &mut buf).await {
				let msg = Message::decode(&body).unwrap();
				seen.push(msg.method().unwrap_or_default().to_string());
				if let Message::Request(req) = msg {
					let reply = Message::Response(AnyResponse {
						id: req.id,
						result: Some(json!({"capabilities": {"hoverProvider": true}})),
						error: None,
					});
					codec::write_frame(&mut pw, Framing::ContentLength, &reply.encode()).await.unwrap();
				}
				if seen.iter().any(|m| m == "initialized") {
					break;
				}
			}
			seen
		});
		(WorkerHandle::new(id(), conn, None), peer)
	}

	#[test]
	fn ids_render_generation_and_session() {
		assert_eq!(id().to_string(), "w3/s7");
	}

	#[tokio::test(flavor = "current_thread")]
	async fn concurrent_initialize_shares_one_handshake() {
		let (worker, peer) = handle_with_peer();
		let mut states = worker.subscribe();
		assert_eq!(worker.state(), WorkerState::Uninitialized);

		let (a, b) = tokio::join!(
			worker.initialize(|| json!({"processId": null}), Duration::from_secs(5)),
			worker.initialize(|| json!({"processId": null}), Duration::from_secs(5)),
		);
		assert_eq!(a.unwrap(), b.unwrap());
		assert_eq!(worker.capabilities(), Some(&json!({"hoverProvider": true})));
		assert_eq!(worker.state(), WorkerState::Ready);
		assert!(states.has_changed().unwrap());

		assert_eq!(peer.await.unwrap(), vec!["initialize".to_string(), "initialized".to_string()]);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn failed_handshake_is_never_repeated_and_terminate_is_final() {
		let (ours, _theirs) = tokio::io::duplex(1024);
		let (r, w) = tokio::io::split(ours);
		let conn = Connection::spawn("silent", BufReader::new(r), w, Framing::ContentLength, None);
		let worker = WorkerHandle::new(id(), conn.clone(), None);

		let err = worker.initialize(|| JsonValue::Null, Duration::from_millis(100)).await.unwrap_err();
		assert!(matches!(err, BrokerError::Timeout { ref method } if method == "initialize"));
		assert_eq!(worker.state(), WorkerState::Terminated);
		assert!(!worker.is_alive());
		assert!(worker.capabilities().is_none());

		let err = worker.initialize(|| JsonValue::Null, Duration::from_millis(100)).await.unwrap_err();
		assert!(matches!(err, BrokerError::WorkerCrashed));
		assert_eq!(conn.correlator().pending_count(), 0);

		worker.terminate().await;
		worker.terminate().await;
		assert_eq!(worker.state(), WorkerState::Terminated);
		assert!(!worker.is_alive());
		assert!(matches!(worker.notify("x", JsonValue::Null), Err(BrokerError::WorkerCrashed)));
	}
}
