//! Editor-facing TCP front end.
//!
//! Each accepted connection is one editing session. Frames are newline
//! delimited JSON ([`EditorFrame`] in, [`EditorReply`] out). Lifecycle frames
//! (`open`, `change`, `close`) are applied in arrival order; queries run
//! concurrently and their replies may come back in any order, matched by id.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use wharf_broker_proto::{EditorFrame, EditorOp, EditorReply, FrameId, WirePosition};

use crate::config::BrokerConfig;
use crate::document::Workspace;
use crate::pool::WorkerPool;
use crate::session::{Position, SessionFacade};
use crate::worker::SessionKey;

/// Accept editor connections on `listener` until `shutdown` fires.
///
/// Sessions share `pool`. Open connections are torn down on shutdown; the
/// caller still owns the pool and should shut it down afterwards.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn serve(
	listener: TcpListener,
	pool: WorkerPool,
	config: Arc<BrokerConfig>,
	shutdown: CancellationToken,
) -> std::io::Result<()> {
	let workspace = Arc::new(Workspace::from_config(&config.worker));
	tracing::info!(addr = %listener.local_addr()?, root = %workspace.root().display(), "Broker listening");

	let mut next_session = 1;
	let mut connections = JoinSet::new();
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => {
				tracing::info!("Broker front end shutting down");
				break;
			}
			res = listener.accept() => match res {
				Ok((stream, peer)) => {
					let key = SessionKey(next_session);
					next_session += 1;
					tracing::info!(session = %key, %peer, "Editor connected");
					let session = Arc::new(SessionFacade::new(key, pool.clone(), workspace.clone(), &config));
					connections.spawn(handle_connection(stream, session, shutdown.child_token()));
				}
				Err(e) => {
					tracing::error!(error = %e, "Failed to accept connection");
				}
			},
		}
		while connections.try_join_next().is_some() {}
	}

	while connections.join_next().await.is_some() {}
	Ok(())
}

/// Serve one session until the editor disconnects or `shutdown` fires.
async fn handle_connection(stream: TcpStream, session: Arc<SessionFacade>, shutdown: CancellationToken) {
	let key = session.key();
	let (reader, writer) = stream.into_split();
	let (reply_tx, reply_rx) = mpsc::unbounded_channel();
	let writer_task = tokio::spawn(write_replies(key, writer, reply_rx));

	let mut reader = BufReader::new(reader);
	let mut buf = Vec::new();
	let mut queries = JoinSet::new();
	loop {
		buf.clear();
		let read = tokio::select! {
			_ = shutdown.cancelled() => break,
			read = reader.read_until(b'\n', &mut buf) => read,
		};
		match read {
			Ok(0) => break,
			Ok(_) => {}
			Err(e) => {
				tracing::warn!(session = %key, error = %e, "Editor connection read failed");
				break;
			}
		}
		// Lines that are not UTF-8 get a malformed-frame reply; the connection stays up.
		let line = buf.trim_ascii();
		if line.is_empty() {
			continue;
		}

		let frame = match serde_json::from_slice::<EditorFrame>(line) {
			Ok(frame) => frame,
			Err(err) => {
				tracing::debug!(session = %key, error = %err, "ipc.frame.malformed");
				let _ = reply_tx.send(EditorReply::error(frame_id(line), format!("malformed frame: {err}")));
				continue;
			}
		};

		let id = frame.id;
		tracing::trace!(session = %key, id = id.0, op = frame.op.name(), "ipc.frame");
		match frame.op {
			EditorOp::Open { uri, text } => {
				let reply = respond(id, session.open(&uri, &text));
				let _ = reply_tx.send(reply);
			}
			EditorOp::Change { uri, text } => {
				let reply = respond(id, session.change(&uri, &text));
				let _ = reply_tx.send(reply);
			}
			EditorOp::Close { uri } => {
				let reply = respond(id, session.close(&uri));
				let _ = reply_tx.send(reply);
			}
			query => {
				let session = session.clone();
				let replies = reply_tx.clone();
				queries.spawn(async move {
					let reply = run_query(&session, id, query).await;
					let _ = replies.send(reply);
				});
			}
		}
		while queries.try_join_next().is_some() {}
	}

	// Nobody is left to read the answers.
	queries.abort_all();
	while queries.join_next().await.is_some() {}
	session.shutdown().await;
	drop(reply_tx);
	let _ = writer_task.await;
	tracing::info!(session = %key, "Editor disconnected");
}

async fn run_query(session: &SessionFacade, id: FrameId, op: EditorOp) -> EditorReply {
	match op {
		EditorOp::Complete { uri, position } => reply(id, session.complete(&uri, to_position(position)).await),
		EditorOp::Define { uri, position } => reply(id, session.define(&uri, to_position(position)).await),
		EditorOp::Hover { uri, position } => reply(id, session.hover(&uri, to_position(position)).await),
		EditorOp::References { uri, position } => {
			reply(id, session.find_references(&uri, to_position(position)).await)
		}
		other => EditorReply::error(Some(id), format!("`{}` is not a query", other.name())),
	}
}

async fn write_replies(key: SessionKey, mut writer: OwnedWriteHalf, mut replies: mpsc::UnboundedReceiver<EditorReply>) {
	while let Some(reply) = replies.recv().await {
		let mut line = match serde_json::to_vec(&reply) {
			Ok(line) => line,
			Err(e) => {
				tracing::error!(session = %key, error = %e, "Failed to encode reply");
				continue;
			}
		};
		line.push(b'\n');
		if let Err(e) = writer.write_all(&line).await {
			tracing::debug!(session = %key, error = %e, "ipc.write.failed");
			break;
		}
	}
	let _ = writer.shutdown().await;
}

fn reply<T: Serialize>(id: FrameId, value: T) -> EditorReply {
	match serde_json::to_value(value) {
		Ok(result) => EditorReply::ok(id, result),
		Err(e) => EditorReply::error(Some(id), e.to_string()),
	}
}

fn respond<T: Serialize>(id: FrameId, outcome: crate::Result<T>) -> EditorReply {
	match outcome {
		Ok(value) => reply(id, value),
		Err(err) => EditorReply::error(Some(id), err.to_string()),
	}
}

/// Best-effort id of a frame that failed to parse.
fn frame_id(line: &[u8]) -> Option<FrameId> {
	serde_json::from_slice::<JsonValue>(line)
		.ok()?
		.get("id")?
		.as_u64()
		.map(FrameId)
}

fn to_position(position: WirePosition) -> Position {
	Position::new(position.line, position.character)
}
