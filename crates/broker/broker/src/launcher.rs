//! Worker launcher abstraction for production and testing.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use wharf_rpc::{CallError, Connection};

use crate::config::WorkerConfig;
use crate::error::{BrokerError, Result};
use crate::pool::{ExitKind, ExitReporter};
use crate::worker::{WorkerControl, WorkerHandle, WorkerId};

/// Deadline for the `shutdown` request on requested termination.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);
/// How long the process gets to exit after `exit` before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Future returned by [`WorkerLauncher::launch`].
pub type LaunchFuture = Pin<Box<dyn Future<Output = Result<WorkerHandle>> + Send>>;

/// Starts worker processes.
///
/// This abstraction allows the pool to use real subprocesses in production
/// and in-process fake workers for testing.
pub trait WorkerLauncher: Send + Sync + 'static {
	/// Start the worker `id`.
	///
	/// The launcher owns the process lifetime: it must report the exit to
	/// `exits`, as [`ExitKind::Requested`] when the handle's control channel
	/// asked for it and [`ExitKind::Unexpected`] otherwise.
	fn launch(&self, id: WorkerId, exits: ExitReporter) -> LaunchFuture;
}

/// Production launcher that spawns the configured command over stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
	config: Arc<WorkerConfig>,
}

impl ProcessLauncher {
	/// Launcher for `config`.
	#[must_use]
	pub fn new(config: WorkerConfig) -> Self {
		Self { config: Arc::new(config) }
	}
}

impl WorkerLauncher for ProcessLauncher {
	/// Spawn the process and start its lifecycle monitor.
	///
	/// The monitor task owns the child and waits for either its exit or a
	/// termination request from the handle.
	fn launch(&self, id: WorkerId, exits: ExitReporter) -> LaunchFuture {
		let config = self.config.clone();
		Box::pin(async move {
			let spawn_failed = |reason: String| BrokerError::SpawnFailed {
				command: config.command.clone(),
				reason,
			};

			let mut child = Command::new(&config.command)
				.args(&config.args)
				.envs(&config.env)
				.current_dir(config.root_dir())
				.stdin(Stdio::piped())
				.stdout(Stdio::piped())
				.stderr(Stdio::piped())
				.kill_on_drop(true)
				.spawn()
				.map_err(|e| {
					tracing::error!(worker = %id, command = %config.command, error = %e, "Failed to spawn worker");
					spawn_failed(e.to_string())
				})?;

			let stdin = child.stdin.take().ok_or_else(|| spawn_failed("stdin unavailable".into()))?;
			let stdout = child.stdout.take().ok_or_else(|| spawn_failed("stdout unavailable".into()))?;
			if let Some(stderr) = child.stderr.take() {
				tokio::spawn(forward_stderr(id, stderr));
			}

			let connection = Connection::spawn(id.to_string(), BufReader::new(stdout), stdin, config.framing, None);
			tracing::info!(worker = %id, command = %config.command, pid = ?child.id(), "Worker process spawned");

			let (term_tx, term_rx) = oneshot::channel();
			let (done_tx, done_rx) = oneshot::channel();
			tokio::spawn(monitor(id, child, connection.clone(), term_rx, done_tx, exits));

			Ok(WorkerHandle::new(id, connection, Some(WorkerControl { term_tx, done_rx })))
		})
	}
}

async fn monitor(
	id: WorkerId,
	mut child: Child,
	connection: Arc<Connection>,
	mut term_rx: oneshot::Receiver<()>,
	done_tx: oneshot::Sender<()>,
	exits: ExitReporter,
) {
	tokio::select! {
		res = child.wait() => {
			let code = match res {
				Ok(status) => {
					tracing::warn!(worker = %id, ?status, "Worker process exited");
					status.code()
				}
				Err(e) => {
					tracing::error!(worker = %id, error = %e, "Failed to wait on worker process");
					None
				}
			};
			connection.correlator().fail_all(CallError::WorkerCrashed);
			exits.report(id, ExitKind::Unexpected { code });
		}
		// Also fires when every handle is dropped.
		_ = &mut term_rx => {
			tracing::info!(worker = %id, "Termination requested, shutting down worker");
			let _ = connection.call("shutdown", JsonValue::Null, SHUTDOWN_GRACE).await;
			let _ = connection.notify("exit", JsonValue::Null);

			if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
				tracing::debug!(worker = %id, "worker.kill");
				let _ = child.kill().await;
				let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
			}
			connection.close();
			exits.report(id, ExitKind::Requested);
		}
	}

	let _ = done_tx.send(());
}

async fn forward_stderr(id: WorkerId, stderr: ChildStderr) {
	let mut lines = BufReader::new(stderr).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		tracing::debug!(worker = %id, %line, "worker.stderr");
	}
}

/// Test helpers for faking workers.
#[doc(hidden)]
pub mod test_helpers {
	use std::collections::{HashMap, HashSet};
	use std::sync::atomic::{AtomicUsize, Ordering};

	use parking_lot::Mutex;
	use serde_json::json;
	use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
	use tokio::sync::mpsc;
	use tokio_util::sync::CancellationToken;
	use wharf_rpc::{AnyNotification, AnyRequest, AnyResponse, ErrorCode, Framing, Message, ResponseError, codec};

	use super::*;

	/// How fake workers answer requests.
	#[derive(Debug, Clone)]
	pub struct FakeBehavior {
		/// Canned results by method. Methods missing here get `MethodNotFound`.
		pub results: HashMap<String, JsonValue>,
		/// Methods that are never answered.
		pub silent: HashSet<String>,
		/// Methods answered only after a delay.
		pub delays: HashMap<String, Duration>,
		/// How long `launch` takes before the worker exists.
		pub launch_delay: Duration,
	}

	impl Default for FakeBehavior {
		fn default() -> Self {
			let results = [
				(
					"initialize",
					json!({"capabilities": {"textDocumentSync": {"openClose": true, "change": 1}, "hoverProvider": true}}),
				),
				("shutdown", JsonValue::Null),
				(
					"textDocument/completion",
					json!([{"label": "greet", "kind": 3}, {"label": "greeting", "kind": 6}]),
				),
				(
					"textDocument/hover",
					json!({"contents": {"kind": "markdown", "value": "greet(name: str) -> str"}}),
				),
				(
					"textDocument/definition",
					json!({"uri": "file:///ws/lib.py", "range": {"start": {"line": 3, "character": 4}, "end": {"line": 3, "character": 9}}}),
				),
				(
					"textDocument/references",
					json!([
						{"uri": "file:///ws/main.py", "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 5}}},
						{"uri": "file:///ws/lib.py", "range": {"start": {"line": 3, "character": 4}, "end": {"line": 3, "character": 9}}}
					]),
				),
			]
			.into_iter()
			.map(|(method, result)| (method.to_string(), result))
			.collect();

			Self {
				results,
				silent: HashSet::new(),
				delays: HashMap::new(),
				launch_delay: Duration::ZERO,
			}
		}
	}

	impl FakeBehavior {
		/// Never answer `method`.
		#[must_use]
		pub fn silent(mut self, method: &str) -> Self {
			self.silent.insert(method.to_string());
			self
		}

		/// Answer `method` after `delay`.
		#[must_use]
		pub fn delayed(mut self, method: &str, delay: Duration) -> Self {
			self.delays.insert(method.to_string(), delay);
			self
		}

		/// Answer `method` with `result`.
		#[must_use]
		pub fn respond(mut self, method: &str, result: JsonValue) -> Self {
			self.results.insert(method.to_string(), result);
			self
		}

		fn reply(&self, req: &AnyRequest) -> Message {
			let (result, error) = match self.results.get(&req.method) {
				Some(result) => (Some(result.clone()), None),
				None => (
					None,
					Some(ResponseError::new(
						ErrorCode::METHOD_NOT_FOUND,
						format!("Method not found: {}", req.method),
					)),
				),
			};
			Message::Response(AnyResponse {
				id: req.id.clone(),
				result,
				error,
			})
		}
	}

	/// Test-side view of one fake worker.
	#[derive(Debug, Clone)]
	pub struct FakeWorker {
		/// Identity the pool launched it with.
		pub id: WorkerId,
		notifications: Arc<Mutex<Vec<AnyNotification>>>,
		requests: Arc<Mutex<Vec<AnyRequest>>>,
		crashed: CancellationToken,
		stop: CancellationToken,
	}

	impl FakeWorker {
		/// Every notification received, in order.
		pub fn notifications(&self) -> Vec<AnyNotification> {
			self.notifications.lock().clone()
		}

		/// Notifications with `method`.
		pub fn notifications_for(&self, method: &str) -> Vec<AnyNotification> {
			self.notifications.lock().iter().filter(|n| n.method == method).cloned().collect()
		}

		/// Every request received, in order.
		pub fn requests(&self) -> Vec<AnyRequest> {
			self.requests.lock().clone()
		}

		/// How many requests or notifications with `method` arrived.
		pub fn count(&self, method: &str) -> usize {
			self.notifications.lock().iter().filter(|n| n.method == method).count()
				+ self.requests.lock().iter().filter(|r| r.method == method).count()
		}

		/// Kill the worker as if the process died.
		pub fn crash(&self) {
			self.crashed.cancel();
			self.stop.cancel();
		}

		/// Whether the fake is still serving.
		pub fn is_running(&self) -> bool {
			!self.stop.is_cancelled()
		}
	}

	/// Launcher that creates in-process fake workers over `tokio::io::duplex`.
	#[derive(Clone, Default)]
	pub struct TestLauncher {
		workers: Arc<Mutex<Vec<FakeWorker>>>,
		behavior: Arc<Mutex<FakeBehavior>>,
		failures: Arc<AtomicUsize>,
	}

	impl TestLauncher {
		/// Launcher whose workers answer with [`FakeBehavior::default`].
		#[must_use]
		pub fn new() -> Self {
			Self::default()
		}

		/// Launcher whose workers follow `behavior`.
		#[must_use]
		pub fn with_behavior(behavior: FakeBehavior) -> Self {
			let launcher = Self::default();
			*launcher.behavior.lock() = behavior;
			launcher
		}

		/// Behavior for workers launched from now on.
		pub fn set_behavior(&self, behavior: FakeBehavior) {
			*self.behavior.lock() = behavior;
		}

		/// Make the next `count` launches fail.
		pub fn fail_next(&self, count: usize) {
			self.failures.store(count, Ordering::SeqCst);
		}

		/// Every worker launched so far, oldest first.
		pub fn workers(&self) -> Vec<FakeWorker> {
			self.workers.lock().clone()
		}

		/// Number of successful launches.
		pub fn launches(&self) -> usize {
			self.workers.lock().len()
		}

		/// The most recently launched worker.
		pub fn latest(&self) -> Option<FakeWorker> {
			self.workers.lock().last().cloned()
		}

		/// Workers still serving.
		pub fn running(&self) -> usize {
			self.workers.lock().iter().filter(|w| w.is_running()).count()
		}
	}

	impl WorkerLauncher for TestLauncher {
		fn launch(&self, id: WorkerId, exits: ExitReporter) -> LaunchFuture {
			let workers = self.workers.clone();
			let behavior = self.behavior.lock().clone();
			let fail = self
				.failures
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
				.is_ok();

			Box::pin(async move {
				if !behavior.launch_delay.is_zero() {
					tokio::time::sleep(behavior.launch_delay).await;
				}
				if fail {
					return Err(BrokerError::SpawnFailed {
						command: "fake-worker".into(),
						reason: "launch failure requested by test".into(),
					});
				}

				let (ours, theirs) = tokio::io::duplex(64 * 1024);
				let (r, w) = tokio::io::split(ours);
				let connection = Connection::spawn(id.to_string(), BufReader::new(r), w, Framing::ContentLength, None);

				let fake = FakeWorker {
					id,
					notifications: Arc::default(),
					requests: Arc::default(),
					crashed: CancellationToken::new(),
					stop: CancellationToken::new(),
				};
				workers.lock().push(fake.clone());

				let (reader, writer) = tokio::io::split(theirs);
				let (reply_tx, reply_rx) = mpsc::unbounded_channel();
				tokio::spawn(serve_requests(reader, reply_tx, behavior, fake.clone()));
				tokio::spawn(write_replies(writer, reply_rx, fake.stop.clone()));

				let (term_tx, term_rx) = oneshot::channel();
				let (done_tx, done_rx) = oneshot::channel();
				tokio::spawn(fake_monitor(id, fake, connection.clone(), term_rx, done_tx, exits));

				Ok(WorkerHandle::new(id, connection, Some(WorkerControl { term_tx, done_rx })))
			})
		}
	}

	async fn serve_requests(
		reader: ReadHalf<DuplexStream>,
		replies: mpsc::UnboundedSender<Message>,
		behavior: FakeBehavior,
		fake: FakeWorker,
	) {
		let mut reader = BufReader::new(reader);
		let mut buf = Vec::new();
		loop {
			let frame = tokio::select! {
				_ = fake.stop.cancelled() => break,
				frame = codec::read_frame(&mut reader, Framing::ContentLength, &mut buf) => frame,
			};
			let Ok(Some(body)) = frame else {
				break;
			};
			let Ok(msg) = Message::decode(&body) else {
				continue;
			};

			match msg {
				Message::Notification(notif) => {
					let exit = notif.method == "exit";
					fake.notifications.lock().push(notif);
					if exit {
						break;
					}
				}
				Message::Request(req) => {
					fake.requests.lock().push(req.clone());
					if behavior.silent.contains(&req.method) {
						continue;
					}
					let reply = behavior.reply(&req);
					match behavior.delays.get(&req.method).copied() {
						Some(delay) => {
							let replies = replies.clone();
							tokio::spawn(async move {
								tokio::time::sleep(delay).await;
								let _ = replies.send(reply);
							});
						}
						None => {
							let _ = replies.send(reply);
						}
					}
				}
				Message::Response(_) => {}
			}
		}
		fake.stop.cancel();
	}

	async fn write_replies(mut writer: WriteHalf<DuplexStream>, mut replies: mpsc::UnboundedReceiver<Message>, stop: CancellationToken) {
		loop {
			let reply = tokio::select! {
				_ = stop.cancelled() => break,
				reply = replies.recv() => match reply {
					Some(reply) => reply,
					None => break,
				},
			};
			if codec::write_frame(&mut writer, Framing::ContentLength, &reply.encode()).await.is_err() {
				break;
			}
		}
	}

	async fn fake_monitor(
		id: WorkerId,
		fake: FakeWorker,
		connection: Arc<Connection>,
		mut term_rx: oneshot::Receiver<()>,
		done_tx: oneshot::Sender<()>,
		exits: ExitReporter,
	) {
		tokio::select! {
			_ = fake.crashed.cancelled() => {
				connection.correlator().fail_all(CallError::WorkerCrashed);
				exits.report(id, ExitKind::Unexpected { code: None });
			}
			_ = &mut term_rx => {
				let _ = connection.call("shutdown", JsonValue::Null, SHUTDOWN_GRACE).await;
				let _ = connection.notify("exit", JsonValue::Null);
				let _ = tokio::time::timeout(EXIT_GRACE, fake.stop.cancelled()).await;
				fake.stop.cancel();
				connection.close();
				exits.report(id, ExitKind::Requested);
			}
		}
		let _ = done_tx.send(());
	}
}
