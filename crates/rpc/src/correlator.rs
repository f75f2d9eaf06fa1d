//! Request/response correlation for a single duplex channel.
//!
//! The correlator allocates request ids, records a pending entry per
//! outstanding request and completes it from whichever of the response or
//! the deadline comes first. Removal from the pending map is the single point
//! of truth: whoever removes an entry owns its completion, the loser finds
//! nothing and does nothing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::CallError;
use crate::message::{AnyNotification, AnyRequest, Message, RequestId};

type Outcome = Result<JsonValue, CallError>;

/// A request awaiting its response.
#[derive(Debug)]
struct PendingRequest {
	method: String,
	created_at: Instant,
	tx: oneshot::Sender<Outcome>,
}

#[derive(Debug)]
struct CorrelatorState {
	/// Next id to hand out. Starts at 1 and only grows.
	next_id: i64,
	pending: HashMap<RequestId, PendingRequest>,
	/// Set once the channel is gone; new sends fail with this error.
	closed: Option<CallError>,
}

/// Correlates outbound requests with inbound responses on one channel.
#[derive(Debug)]
pub struct RequestCorrelator {
	label: String,
	state: Mutex<CorrelatorState>,
	outbound: mpsc::UnboundedSender<Message>,
}

/// Receiving half of a request sent with [`RequestCorrelator::send`].
#[derive(Debug)]
pub struct PendingResponse {
	id: RequestId,
	rx: oneshot::Receiver<Outcome>,
}

impl PendingResponse {
	/// Id assigned to the request.
	pub fn id(&self) -> &RequestId {
		&self.id
	}

	/// Wait for the response without a deadline.
	///
	/// # Errors
	///
	/// Returns the failure the request was completed with, or
	/// [`CallError::ChannelClosed`] if the correlator went away.
	pub async fn recv(self) -> Outcome {
		self.rx.await.unwrap_or(Err(CallError::ChannelClosed))
	}
}

impl RequestCorrelator {
	/// Create a correlator writing outbound envelopes into `outbound`.
	///
	/// `label` identifies the channel in log events.
	pub fn new(label: impl Into<String>, outbound: mpsc::UnboundedSender<Message>) -> Self {
		Self {
			label: label.into(),
			state: Mutex::new(CorrelatorState {
				next_id: 1,
				pending: HashMap::new(),
				closed: None,
			}),
			outbound,
		}
	}

	/// Label used in log events.
	pub fn label(&self) -> &str {
		&self.label
	}

	/// Allocate an id, record the pending request and queue the envelope.
	///
	/// The pending entry is recorded before the envelope is queued, so a
	/// response can never overtake its own registration.
	///
	/// # Errors
	///
	/// Fails with the channel's close reason once [`Self::fail_all`] has run,
	/// or with [`CallError::ChannelClosed`] if the writer is gone.
	pub fn send(&self, method: impl Into<String>, params: JsonValue) -> Result<PendingResponse, CallError> {
		let method = method.into();
		let (tx, rx) = oneshot::channel();
		let id = {
			let mut state = self.state.lock();
			if let Some(reason) = &state.closed {
				return Err(reason.clone());
			}
			let id = RequestId::Number(state.next_id);
			state.next_id += 1;
			let previous = state.pending.insert(
				id.clone(),
				PendingRequest {
					method: method.clone(),
					created_at: Instant::now(),
					tx,
				},
			);
			debug_assert!(previous.is_none(), "request id {id} reused while pending");
			id
		};

		trace!(channel = %self.label, %id, %method, "rpc.send");
		let envelope = Message::Request(AnyRequest {
			id: id.clone(),
			method,
			params,
		});
		if self.outbound.send(envelope).is_err() {
			self.forget(&id);
			return Err(CallError::ChannelClosed);
		}

		Ok(PendingResponse { id, rx })
	}

	/// Send a request and wait for its response or the deadline.
	///
	/// Dropping the returned future before it completes removes the pending
	/// entry, so an abandoned call leaves nothing behind.
	///
	/// # Errors
	///
	/// [`CallError::Timeout`] when `timeout` elapses first; otherwise whatever
	/// the request was completed with.
	pub async fn call(&self, method: &str, params: JsonValue, timeout: Duration) -> Outcome {
		let PendingResponse { id, mut rx } = self.send(method, params)?;
		let mut guard = AbandonGuard {
			correlator: self,
			id: Some(&id),
		};
		let waited = tokio::time::timeout(timeout, &mut rx).await;
		guard.id = None;

		match waited {
			Ok(outcome) => outcome.unwrap_or(Err(CallError::ChannelClosed)),
			Err(_) => {
				if self.forget(&id) {
					debug!(channel = %self.label, %id, method, ?timeout, "rpc.timeout");
					return Err(CallError::Timeout {
						method: method.to_string(),
						timeout,
					});
				}
				// The response won the race and already completed the sender.
				rx.try_recv().unwrap_or(Err(CallError::ChannelClosed))
			}
		}
	}

	/// Queue a notification.
	///
	/// # Errors
	///
	/// Fails once the channel is closed.
	pub fn notify(&self, method: impl Into<String>, params: JsonValue) -> Result<(), CallError> {
		if let Some(reason) = &self.state.lock().closed {
			return Err(reason.clone());
		}
		let method = method.into();
		trace!(channel = %self.label, %method, "rpc.notify");
		self.outbound
			.send(Message::Notification(AnyNotification { method, params }))
			.map_err(|_| CallError::ChannelClosed)
	}

	/// Route an inbound envelope.
	///
	/// Responses with a pending id complete that request. Responses without
	/// one (late arrivals after a timeout, or ids never issued) are logged and
	/// dropped. Requests and notifications are handed back to the caller.
	pub fn dispatch(&self, msg: Message) -> Option<Message> {
		let resp = match msg {
			Message::Response(resp) => resp,
			other => return Some(other),
		};

		let pending = self.state.lock().pending.remove(&resp.id);
		let Some(pending) = pending else {
			debug!(channel = %self.label, id = %resp.id, "rpc.response.unmatched");
			return None;
		};

		trace!(
			channel = %self.label,
			id = %resp.id,
			method = %pending.method,
			elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
			"rpc.response"
		);
		let outcome = resp.into_result().map_err(CallError::from);
		// The caller may have stopped waiting; that is not an error here.
		let _ = pending.tx.send(outcome);
		None
	}

	/// Fail every pending request with `reason` and refuse new ones.
	///
	/// Returns how many requests were failed.
	pub fn fail_all(&self, reason: CallError) -> usize {
		let drained: Vec<_> = {
			let mut state = self.state.lock();
			if state.closed.is_none() {
				state.closed = Some(reason.clone());
			}
			state.pending.drain().collect()
		};

		if !drained.is_empty() {
			warn!(channel = %self.label, count = drained.len(), %reason, "rpc.pending.failed");
		}
		let count = drained.len();
		for (_, pending) in drained {
			let _ = pending.tx.send(Err(reason.clone()));
		}
		count
	}

	/// Number of requests still awaiting a response.
	pub fn pending_count(&self) -> usize {
		self.state.lock().pending.len()
	}

	/// Whether [`Self::fail_all`] has closed this correlator.
	pub fn is_closed(&self) -> bool {
		self.state.lock().closed.is_some()
	}

	/// Remove a pending entry. Returns `false` if it was already gone.
	fn forget(&self, id: &RequestId) -> bool {
		self.state.lock().pending.remove(id).is_some()
	}
}

/// Forgets an in-flight [`RequestCorrelator::call`] whose future is dropped.
struct AbandonGuard<'a> {
	correlator: &'a RequestCorrelator,
	id: Option<&'a RequestId>,
}

impl Drop for AbandonGuard<'_> {
	fn drop(&mut self) {
		if let Some(id) = self.id.take()
			&& self.correlator.forget(id)
		{
			trace!(channel = %self.correlator.label, %id, "rpc.call.abandoned");
		}
	}
}

#[cfg(test)]
mod tests;
