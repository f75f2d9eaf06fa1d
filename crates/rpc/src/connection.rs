//! A duplex channel with a single writer and a response-routing reader.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, Framing};
use crate::correlator::{PendingResponse, RequestCorrelator};
use crate::error::CallError;
use crate::message::Message;

/// Sender for peer-initiated messages (notifications and requests).
pub type InboundSender = mpsc::UnboundedSender<Message>;

/// One duplex channel to a worker.
///
/// Writes from any number of callers are funneled through one writer task,
/// so envelopes are never interleaved on the wire. The reader task routes
/// responses through the [`RequestCorrelator`]. When either side of the
/// channel breaks, every pending request fails with
/// [`CallError::WorkerCrashed`].
#[derive(Debug)]
pub struct Connection {
	correlator: Arc<RequestCorrelator>,
	shutdown: CancellationToken,
	closed: CancellationToken,
}

impl Connection {
	/// Start the reader and writer tasks for a channel.
	///
	/// Peer-initiated messages are forwarded to `inbound` when given, and
	/// logged and dropped otherwise. Must be called within a Tokio runtime.
	pub fn spawn<R, W>(label: impl Into<String>, reader: R, writer: W, framing: Framing, inbound: Option<InboundSender>) -> Arc<Self>
	where
		R: AsyncBufRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let label = label.into();
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let correlator = Arc::new(RequestCorrelator::new(label.clone(), outbound_tx));
		let shutdown = CancellationToken::new();
		let closed = CancellationToken::new();

		tokio::spawn(run_writer(
			label.clone(),
			writer,
			framing,
			outbound_rx,
			correlator.clone(),
			shutdown.clone(),
			closed.clone(),
		));
		tokio::spawn(run_reader(label, reader, framing, inbound, correlator.clone(), shutdown.clone(), closed.clone()));

		Arc::new(Self {
			correlator,
			shutdown,
			closed,
		})
	}

	/// The correlator for this channel.
	pub fn correlator(&self) -> &Arc<RequestCorrelator> {
		&self.correlator
	}

	/// Send a request and wait for the response or `timeout`.
	///
	/// # Errors
	///
	/// See [`RequestCorrelator::call`].
	pub async fn call(&self, method: &str, params: JsonValue, timeout: Duration) -> Result<JsonValue, CallError> {
		self.correlator.call(method, params, timeout).await
	}

	/// Send a request without a deadline.
	///
	/// # Errors
	///
	/// See [`RequestCorrelator::send`].
	pub fn send(&self, method: &str, params: JsonValue) -> Result<PendingResponse, CallError> {
		self.correlator.send(method, params)
	}

	/// Queue a notification.
	///
	/// # Errors
	///
	/// Fails once the channel is closed.
	pub fn notify(&self, method: &str, params: JsonValue) -> Result<(), CallError> {
		self.correlator.notify(method, params)
	}

	/// Whether the channel has stopped.
	pub fn is_closed(&self) -> bool {
		self.closed.is_cancelled()
	}

	/// Resolves once the channel has stopped.
	pub async fn closed(&self) {
		self.closed.cancelled().await;
	}

	/// Stop both tasks. Pending requests fail with [`CallError::ChannelClosed`].
	pub fn close(&self) {
		self.correlator.fail_all(CallError::ChannelClosed);
		self.shutdown.cancel();
	}
}

async fn run_writer<W>(
	label: String,
	mut writer: W,
	framing: Framing,
	mut outbound_rx: mpsc::UnboundedReceiver<Message>,
	correlator: Arc<RequestCorrelator>,
	shutdown: CancellationToken,
	closed: CancellationToken,
) where
	W: AsyncWrite + Unpin,
{
	loop {
		let msg = tokio::select! {
			biased;
			_ = shutdown.cancelled() => break,
			_ = closed.cancelled() => break,
			msg = outbound_rx.recv() => match msg {
				Some(msg) => msg,
				None => break,
			},
		};

		if let Err(e) = codec::write_frame(&mut writer, framing, &msg.encode()).await {
			error!(channel = %label, error = %e, "Outbound write failed; closing channel");
			correlator.fail_all(CallError::WorkerCrashed);
			closed.cancel();
			break;
		}
	}
	trace!(channel = %label, "rpc.writer.stopped");
}

async fn run_reader<R>(
	label: String,
	mut reader: R,
	framing: Framing,
	inbound: Option<InboundSender>,
	correlator: Arc<RequestCorrelator>,
	shutdown: CancellationToken,
	closed: CancellationToken,
) where
	R: AsyncBufRead + Unpin,
{
	let mut buf = Vec::new();
	loop {
		let frame = tokio::select! {
			biased;
			_ = shutdown.cancelled() => break,
			frame = codec::read_frame(&mut reader, framing, &mut buf) => frame,
		};

		let body = match frame {
			Ok(Some(body)) => body,
			Ok(None) => {
				info!(channel = %label, "Worker closed its channel");
				correlator.fail_all(CallError::WorkerCrashed);
				break;
			}
			Err(e) => {
				error!(channel = %label, error = %e, "Error reading from worker");
				correlator.fail_all(CallError::WorkerCrashed);
				break;
			}
		};

		let msg = match Message::decode(&body) {
			Ok(msg) => msg,
			Err(e) => {
				warn!(channel = %label, error = %e, "Dropping malformed message");
				continue;
			}
		};

		if let Some(unsolicited) = correlator.dispatch(msg) {
			match &inbound {
				Some(tx) => {
					let _ = tx.send(unsolicited);
				}
				None => {
					debug!(channel = %label, method = ?unsolicited.method(), "Dropping peer-initiated message");
				}
			}
		}
	}
	closed.cancel();
}
