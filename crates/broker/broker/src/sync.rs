//! Document synchronization between shared buffers and the session's worker.
//!
//! The coordinator owns the notification stream for every editable document:
//! one `didOpen` per worker lifetime, debounced full-text `didChange`s with
//! strictly increasing versions, and at most one `didClose` when the last view
//! closes. Views only ever talk to the shared buffer; how many there are is
//! invisible to the worker.
//!
//! Workers are started lazily, so documents are usually opened before any
//! worker exists. [`DocumentSync::attach`] replays `didOpen` for everything
//! not yet open on the attached worker.
//!
//! All notifications for this session are sent under one lock, so per-document
//! ordering on the channel follows the order of the calls that caused them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::buffers::{Acquired, BufferRegistry, Released, SharedBuffer};
use crate::document::{DocUri, EditableUri};
use crate::error::Result;
use crate::worker::WorkerHandle;

/// Where document notifications go.
pub trait NotificationSink: Send + Sync {
	/// Identity of the worker lifetime behind this sink. A new value means a
	/// new process that has seen nothing yet.
	fn generation(&self) -> u64;

	/// Queue one notification.
	///
	/// # Errors
	///
	/// Fails once the worker is gone.
	fn notify(&self, method: &str, params: JsonValue) -> Result<()>;
}

impl NotificationSink for WorkerHandle {
	fn generation(&self) -> u64 {
		self.id().generation
	}

	fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
		WorkerHandle::notify(self, method, params)
	}
}

struct PendingChange {
	timer: u64,
	cancel: CancellationToken,
}

struct TrackedDocument {
	buffer: SharedBuffer,
	/// Generation of the worker this document is open on.
	opened_on: Option<u64>,
	notified_version: i32,
	notified_fingerprint: u64,
	pending: Option<PendingChange>,
}

#[derive(Default)]
struct SyncState {
	docs: HashMap<DocUri, TrackedDocument>,
	sink: Option<Arc<dyn NotificationSink>>,
	next_timer: u64,
}

struct SyncInner {
	buffers: Arc<BufferRegistry>,
	language_id: String,
	debounce: Duration,
	state: Mutex<SyncState>,
}

/// Per-session document synchronization coordinator.
#[derive(Clone)]
pub struct DocumentSync {
	inner: Arc<SyncInner>,
}

impl fmt::Debug for DocumentSync {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = self.inner.state.lock();
		f.debug_struct("DocumentSync")
			.field("documents", &state.docs.len())
			.field("attached", &state.sink.as_ref().map(|s| s.generation()))
			.finish()
	}
}

impl DocumentSync {
	/// Coordinator over `buffers`, announcing documents as `language_id` and
	/// coalescing edits within `debounce`.
	pub fn new(buffers: Arc<BufferRegistry>, language_id: impl Into<String>, debounce: Duration) -> Self {
		Self {
			inner: Arc::new(SyncInner {
				buffers,
				language_id: language_id.into(),
				debounce,
				state: Mutex::new(SyncState::default()),
			}),
		}
	}

	/// The registry backing this coordinator.
	pub fn buffers(&self) -> &Arc<BufferRegistry> {
		&self.inner.buffers
	}

	/// A view opened `doc`.
	///
	/// The first open creates the buffer from `text` and announces it to the
	/// attached worker, if any. Later opens share the live buffer.
	pub fn open(&self, doc: &EditableUri, text: &str) -> Acquired {
		let uri = doc.uri();
		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		let acquired = self.inner.buffers.acquire(uri, text);
		if let Acquired::Created(buffer) = &acquired {
			let mut tracked = TrackedDocument {
				buffer: buffer.clone(),
				opened_on: None,
				notified_version: 0,
				notified_fingerprint: 0,
				pending: None,
			};
			if let Some(sink) = state.sink.clone()
				&& let Err(err) = self.inner.send_open(uri, &mut tracked, sink.as_ref())
			{
				debug!(%uri, error = %err, "sync.detach");
				state.sink = None;
			}
			state.docs.insert(uri.clone(), tracked);
		}
		acquired
	}

	/// A view edited `doc`. Updates the buffer now and schedules a `didChange`.
	///
	/// Returns the new local version, or `None` if the document is not open.
	pub fn change(&self, doc: &EditableUri, text: &str) -> Option<i32> {
		let uri = doc.uri();
		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		let tracked = state.docs.get_mut(uri)?;
		let version = self.inner.buffers.update(uri, text)?;

		if let Some(previous) = tracked.pending.take() {
			previous.cancel.cancel();
		}
		state.next_timer += 1;
		let timer = state.next_timer;
		let cancel = CancellationToken::new();
		tracked.pending = Some(PendingChange {
			timer,
			cancel: cancel.clone(),
		});
		tokio::spawn(debounce(
			Arc::downgrade(&self.inner),
			uri.clone(),
			timer,
			self.inner.debounce,
			cancel,
		));
		trace!(%uri, version, timer, "sync.change.scheduled");
		Some(version)
	}

	/// A view closed `doc`. The last close discards the document and sends
	/// `didClose` if the attached worker had it open.
	pub fn close(&self, doc: &EditableUri) -> Released {
		let uri = doc.uri();
		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		let released = self.inner.buffers.release(uri);
		if !matches!(released, Released::Disposed(_)) {
			return released;
		}

		let Some(mut tracked) = state.docs.remove(uri) else {
			return released;
		};
		if let Some(pending) = tracked.pending.take() {
			pending.cancel.cancel();
		}
		if let Some(sink) = state.sink.clone()
			&& tracked.opened_on == Some(sink.generation())
			&& let Err(err) = sink.notify("textDocument/didClose", json!({"textDocument": {"uri": uri.as_str()}}))
		{
			debug!(%uri, error = %err, "sync.detach");
			state.sink = None;
		}
		released
	}

	/// Send any pending change for `doc` now. Returns whether a `didChange`
	/// went out.
	pub fn flush(&self, doc: &EditableUri) -> bool {
		let uri = doc.uri();
		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		let Some(tracked) = state.docs.get_mut(uri) else {
			return false;
		};
		if let Some(pending) = tracked.pending.take() {
			pending.cancel.cancel();
		}
		let Some(sink) = state.sink.clone() else {
			return false;
		};
		match self.inner.send_change(uri, tracked, sink.as_ref()) {
			Ok(sent) => sent,
			Err(err) => {
				debug!(%uri, error = %err, "sync.detach");
				state.sink = None;
				false
			}
		}
	}

	/// Route notifications to `sink` and open every tracked document on it
	/// that it has not seen. Returns how many `didOpen`s were sent.
	pub fn attach(&self, sink: Arc<dyn NotificationSink>) -> usize {
		let generation = sink.generation();
		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		state.sink = Some(sink.clone());

		let mut opened = 0;
		for (uri, tracked) in &mut state.docs {
			if tracked.opened_on == Some(generation) {
				continue;
			}
			// The snapshot in didOpen supersedes any pending change.
			if let Some(pending) = tracked.pending.take() {
				pending.cancel.cancel();
			}
			if let Err(err) = self.inner.send_open(uri, tracked, sink.as_ref()) {
				warn!(%uri, generation, error = %err, "Worker went away while opening documents");
				state.sink = None;
				return opened;
			}
			opened += 1;
		}
		if opened > 0 {
			debug!(generation, opened, "sync.attach");
		}
		opened
	}

	/// Stop routing notifications to the worker with `generation`.
	pub fn detach(&self, generation: u64) {
		let mut state = self.inner.state.lock();
		if state.sink.as_ref().is_some_and(|s| s.generation() == generation) {
			state.sink = None;
		}
	}

	/// Whether `doc` is open in at least one view.
	pub fn is_tracked(&self, doc: &EditableUri) -> bool {
		self.inner.state.lock().docs.contains_key(doc.uri())
	}

	/// Whether a debounced change for `doc` has not been sent yet.
	pub fn has_pending_change(&self, doc: &EditableUri) -> bool {
		self.inner.state.lock().docs.get(doc.uri()).is_some_and(|t| t.pending.is_some())
	}

	/// Number of tracked documents.
	pub fn len(&self) -> usize {
		self.inner.state.lock().docs.len()
	}

	/// Whether no document is tracked.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl SyncInner {
	fn send_open(&self, uri: &DocUri, tracked: &mut TrackedDocument, sink: &dyn NotificationSink) -> Result<()> {
		let snapshot = tracked.buffer.snapshot();
		sink.notify(
			"textDocument/didOpen",
			json!({
				"textDocument": {
					"uri": uri.as_str(),
					"languageId": self.language_id,
					"version": snapshot.version,
					"text": snapshot.text.to_string(),
				}
			}),
		)?;
		tracked.opened_on = Some(sink.generation());
		tracked.notified_version = snapshot.version;
		tracked.notified_fingerprint = snapshot.fingerprint();
		trace!(%uri, version = snapshot.version, generation = sink.generation(), "sync.did_open");
		Ok(())
	}

	/// Send the buffer's current text if the worker has an older one.
	fn send_change(&self, uri: &DocUri, tracked: &mut TrackedDocument, sink: &dyn NotificationSink) -> Result<bool> {
		if tracked.opened_on != Some(sink.generation()) {
			return Ok(false);
		}
		let snapshot = tracked.buffer.snapshot();
		if snapshot.version <= tracked.notified_version {
			return Ok(false);
		}
		let fingerprint = snapshot.fingerprint();
		if fingerprint == tracked.notified_fingerprint {
			trace!(%uri, version = snapshot.version, "sync.change.unchanged");
			return Ok(false);
		}

		sink.notify(
			"textDocument/didChange",
			json!({
				"textDocument": {"uri": uri.as_str(), "version": snapshot.version},
				"contentChanges": [{"text": snapshot.text.to_string()}],
			}),
		)?;
		tracked.notified_version = snapshot.version;
		tracked.notified_fingerprint = fingerprint;
		trace!(%uri, version = snapshot.version, "sync.did_change");
		Ok(true)
	}

	fn fire(&self, uri: &DocUri, timer: u64) {
		let mut guard = self.state.lock();
		let state = &mut *guard;
		let Some(tracked) = state.docs.get_mut(uri) else {
			return;
		};
		if !tracked.pending.as_ref().is_some_and(|p| p.timer == timer) {
			return;
		}
		tracked.pending = None;
		let Some(sink) = state.sink.clone() else {
			return;
		};
		if let Err(err) = self.send_change(uri, tracked, sink.as_ref()) {
			debug!(%uri, error = %err, "sync.detach");
			state.sink = None;
		}
	}
}

async fn debounce(inner: Weak<SyncInner>, uri: DocUri, timer: u64, delay: Duration, cancel: CancellationToken) {
	tokio::select! {
		_ = cancel.cancelled() => return,
		_ = tokio::time::sleep(delay) => {}
	}
	if let Some(inner) = inner.upgrade() {
		inner.fire(&uri, timer);
	}
}
