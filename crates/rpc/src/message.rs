//! JSON-RPC envelopes.
//!
//! Frames are decoded exactly once, at the channel boundary, into [`Message`].
//! The variant is decided by which of `id` and `method` are present:
//!
//! | `id` | `method` | variant |
//! |------|----------|---------|
//! | yes  | yes      | [`Message::Request`] |
//! | no   | yes      | [`Message::Notification`] |
//! | yes  | no       | [`Message::Response`] |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::DecodeError;

/// Identifier correlating a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	/// Numeric id. Ids allocated by this crate are always numeric.
	Number(i64),
	/// String id, only ever seen on peer-initiated requests.
	String(String),
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Number(n) => write!(f, "{n}"),
			Self::String(s) => write!(f, "{s:?}"),
		}
	}
}

/// JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
	/// Invalid JSON was received.
	pub const PARSE_ERROR: Self = Self(-32700);
	/// The JSON sent is not a valid request object.
	pub const INVALID_REQUEST: Self = Self(-32600);
	/// The method does not exist or is not available.
	pub const METHOD_NOT_FOUND: Self = Self(-32601);
	/// Invalid method parameters.
	pub const INVALID_PARAMS: Self = Self(-32602);
	/// Internal JSON-RPC error.
	pub const INTERNAL_ERROR: Self = Self(-32603);
	/// The server received a request before `initialize`.
	pub const SERVER_NOT_INITIALIZED: Self = Self(-32002);
	/// The request was cancelled.
	pub const REQUEST_CANCELLED: Self = Self(-32800);
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
	/// Error code.
	pub code: ErrorCode,
	/// Human-readable message.
	pub message: String,
	/// Optional structured payload.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}

impl ResponseError {
	/// Create an error without a data payload.
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			data: None,
		}
	}
}

/// A request expecting a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyRequest {
	/// Correlation id.
	pub id: RequestId,
	/// Method name.
	pub method: String,
	/// Parameters, `null` when absent.
	#[serde(default)]
	pub params: JsonValue,
}

/// A one-way message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyNotification {
	/// Method name.
	pub method: String,
	/// Parameters, `null` when absent.
	#[serde(default)]
	pub params: JsonValue,
}

/// The answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyResponse {
	/// Id of the request being answered.
	pub id: RequestId,
	/// Successful result.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<JsonValue>,
	/// Failure.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ResponseError>,
}

impl AnyResponse {
	/// Split into the value a caller awaits.
	pub fn into_result(self) -> Result<JsonValue, ResponseError> {
		match self.error {
			Some(err) => Err(err),
			None => Ok(self.result.unwrap_or(JsonValue::Null)),
		}
	}
}

/// A decoded JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// Request expecting a response.
	Request(AnyRequest),
	/// Response to an earlier request.
	Response(AnyResponse),
	/// One-way notification.
	Notification(AnyNotification),
}

impl Message {
	/// Decode a frame body.
	///
	/// # Errors
	///
	/// Returns [`DecodeError`] if the bytes are not JSON or not an envelope.
	pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
		let value: JsonValue = serde_json::from_slice(body)?;
		Self::from_value(value)
	}

	/// Classify an already parsed JSON value.
	///
	/// # Errors
	///
	/// Returns [`DecodeError::Shape`] for values that are not objects or carry
	/// neither `id` nor `method`.
	pub fn from_value(value: JsonValue) -> Result<Self, DecodeError> {
		let JsonValue::Object(obj) = value else {
			return Err(DecodeError::Shape("envelope is not an object"));
		};
		let has_id = obj.get("id").is_some_and(|id| !id.is_null());
		let has_method = obj.contains_key("method");

		let value = JsonValue::Object(obj);
		match (has_id, has_method) {
			(true, true) => Ok(Self::Request(serde_json::from_value(value)?)),
			(false, true) => Ok(Self::Notification(serde_json::from_value(value)?)),
			(true, false) => Ok(Self::Response(serde_json::from_value(value)?)),
			(false, false) => Err(DecodeError::Shape("neither `id` nor `method` present")),
		}
	}

	/// Build the JSON envelope, including the `jsonrpc` version tag.
	pub fn to_value(&self) -> JsonValue {
		let mut obj = Map::new();
		obj.insert("jsonrpc".into(), JsonValue::from("2.0"));
		match self {
			Self::Request(req) => {
				obj.insert("id".into(), id_value(&req.id));
				obj.insert("method".into(), JsonValue::from(req.method.as_str()));
				obj.insert("params".into(), req.params.clone());
			}
			Self::Notification(notif) => {
				obj.insert("method".into(), JsonValue::from(notif.method.as_str()));
				obj.insert("params".into(), notif.params.clone());
			}
			Self::Response(resp) => {
				obj.insert("id".into(), id_value(&resp.id));
				match &resp.error {
					Some(err) => {
						obj.insert("error".into(), serde_json::to_value(err).unwrap_or(JsonValue::Null));
					}
					None => {
						obj.insert("result".into(), resp.result.clone().unwrap_or(JsonValue::Null));
					}
				}
			}
		}
		JsonValue::Object(obj)
	}

	/// Serialize to a frame body.
	pub fn encode(&self) -> Vec<u8> {
		// Serializing a `Value` tree cannot fail.
		serde_json::to_vec(&self.to_value()).unwrap_or_default()
	}

	/// Method name for requests and notifications.
	pub fn method(&self) -> Option<&str> {
		match self {
			Self::Request(req) => Some(&req.method),
			Self::Notification(notif) => Some(&notif.method),
			Self::Response(_) => None,
		}
	}
}

fn id_value(id: &RequestId) -> JsonValue {
	match id {
		RequestId::Number(n) => JsonValue::from(*n),
		RequestId::String(s) => JsonValue::from(s.as_str()),
	}
}
