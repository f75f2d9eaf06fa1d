use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use super::*;
use crate::message::{AnyResponse, ErrorCode, ResponseError};

fn correlator() -> (RequestCorrelator, mpsc::UnboundedReceiver<Message>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(RequestCorrelator::new("test", tx), rx)
}

fn response(id: i64, result: JsonValue) -> Message {
	Message::Response(AnyResponse {
		id: RequestId::Number(id),
		result: Some(result),
		error: None,
	})
}

#[tokio::test(flavor = "current_thread")]
async fn ids_start_at_one_and_increase() {
	let (c, mut out) = correlator();
	let a = c.send("textDocument/hover", JsonValue::Null).unwrap();
	let b = c.send("textDocument/completion", JsonValue::Null).unwrap();

	assert_eq!(a.id(), &RequestId::Number(1));
	assert_eq!(b.id(), &RequestId::Number(2));
	assert_eq!(c.pending_count(), 2);

	let Some(Message::Request(first)) = out.recv().await else {
		panic!("expected queued request");
	};
	assert_eq!(first.id, RequestId::Number(1));
	assert_eq!(first.method, "textDocument/hover");
}

#[tokio::test(flavor = "current_thread")]
async fn out_of_order_responses_reach_their_callers() {
	let (c, _out) = correlator();
	let first = c.send("a", JsonValue::Null).unwrap();
	let second = c.send("b", JsonValue::Null).unwrap();

	assert!(c.dispatch(response(2, json!("second"))).is_none());
	assert!(c.dispatch(response(1, json!("first"))).is_none());

	assert_eq!(first.recv().await.unwrap(), json!("first"));
	assert_eq!(second.recv().await.unwrap(), json!("second"));
	assert_eq!(c.pending_count(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn error_responses_reject_with_the_error_object() {
	let (c, _out) = correlator();
	let pending = c.send("textDocument/definition", JsonValue::Null).unwrap();
	c.dispatch(Message::Response(AnyResponse {
		id: RequestId::Number(1),
		result: None,
		error: Some(ResponseError::new(ErrorCode::INTERNAL_ERROR, "boom")),
	}));

	let err = pending.recv().await.unwrap_err();
	assert!(matches!(err, CallError::Response(ref e) if e.code == ErrorCode::INTERNAL_ERROR));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn timeout_wins_and_late_response_is_dropped() {
	let (c, _out) = correlator();
	let c = std::sync::Arc::new(c);

	let caller = {
		let c = c.clone();
		tokio::spawn(async move { c.call("textDocument/hover", JsonValue::Null, Duration::from_millis(100)).await })
	};

	tokio::time::sleep(Duration::from_millis(100)).await;
	let outcome = caller.await.unwrap();
	assert!(matches!(outcome, Err(CallError::Timeout { ref method, .. }) if method == "textDocument/hover"));
	assert_eq!(c.pending_count(), 0);

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(c.dispatch(response(1, json!({"contents": "late"}))).is_none());
	assert_eq!(c.pending_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn response_before_deadline_resolves_call() {
	let (c, _out) = correlator();
	let c = std::sync::Arc::new(c);

	let caller = {
		let c = c.clone();
		tokio::spawn(async move { c.call("x", JsonValue::Null, Duration::from_millis(100)).await })
	};
	tokio::task::yield_now().await;
	tokio::time::sleep(Duration::from_millis(40)).await;
	c.dispatch(response(1, json!(42)));

	assert_eq!(caller.await.unwrap().unwrap(), json!(42));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn abandoned_call_leaves_no_pending_entry() {
	let (c, _out) = correlator();
	let c = std::sync::Arc::new(c);

	let caller = {
		let c = c.clone();
		tokio::spawn(async move { c.call("textDocument/hover", JsonValue::Null, Duration::from_secs(5)).await })
	};
	tokio::task::yield_now().await;
	assert_eq!(c.pending_count(), 1);

	caller.abort();
	assert!(caller.await.unwrap_err().is_cancelled());
	assert_eq!(c.pending_count(), 0);

	// A response for the abandoned id is dropped like any late arrival.
	assert!(c.dispatch(response(1, json!("late"))).is_none());
	let next = c.send("textDocument/hover", JsonValue::Null).unwrap();
	assert_eq!(next.id(), &RequestId::Number(2));
}

#[tokio::test(flavor = "current_thread")]
async fn fail_all_rejects_every_pending_request_once() {
	let (c, _out) = correlator();
	let pending: Vec<_> = (0..3).map(|_| c.send("textDocument/references", JsonValue::Null).unwrap()).collect();

	assert_eq!(c.fail_all(CallError::WorkerCrashed), 3);
	for p in pending {
		assert!(matches!(p.recv().await, Err(CallError::WorkerCrashed)));
	}

	// Closed correlators refuse new work with the original reason.
	assert!(matches!(c.send("x", JsonValue::Null), Err(CallError::WorkerCrashed)));
	assert!(c.notify("y", JsonValue::Null).is_err());
	assert_eq!(c.fail_all(CallError::ChannelClosed), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn notifications_and_peer_requests_are_handed_back() {
	let (c, mut out) = correlator();
	c.notify("textDocument/didOpen", json!({"textDocument": {}})).unwrap();
	let Some(Message::Notification(notif)) = out.recv().await else {
		panic!("expected queued notification");
	};
	assert_eq!(notif.method, "textDocument/didOpen");

	let inbound = Message::Notification(crate::message::AnyNotification {
		method: "window/logMessage".into(),
		params: JsonValue::Null,
	});
	assert_eq!(c.dispatch(inbound.clone()), Some(inbound));
}

#[tokio::test(flavor = "current_thread")]
async fn send_fails_when_writer_is_gone() {
	let (c, out) = correlator();
	drop(out);
	assert!(matches!(c.send("x", JsonValue::Null), Err(CallError::ChannelClosed)));
	assert_eq!(c.pending_count(), 0);
}
