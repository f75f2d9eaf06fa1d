//! Wire types for the editor protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Identifier the editor assigns to each frame; echoed in the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

/// Zero-based position on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WirePosition {
	/// Zero-based line.
	pub line: u32,
	/// Zero-based column.
	pub character: u32,
}

/// A frame from the editor to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorFrame {
	/// Correlation id echoed by the reply.
	pub id: FrameId,
	/// The operation.
	#[serde(flatten)]
	pub op: EditorOp,
}

/// Editor operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditorOp {
	/// A view started displaying a document.
	Open {
		/// Document URI.
		uri: String,
		/// Initial text, used only if no other view holds the document.
		text: String,
	},
	/// The shared buffer was edited.
	Change {
		/// Document URI.
		uri: String,
		/// Full new text.
		text: String,
	},
	/// A view stopped displaying a document.
	Close {
		/// Document URI.
		uri: String,
	},
	/// Completion items at a position.
	Complete {
		/// Document URI.
		uri: String,
		/// Cursor position.
		position: WirePosition,
	},
	/// Definition location at a position.
	Define {
		/// Document URI.
		uri: String,
		/// Cursor position.
		position: WirePosition,
	},
	/// Hover text at a position.
	Hover {
		/// Document URI.
		uri: String,
		/// Cursor position.
		position: WirePosition,
	},
	/// Reference locations at a position.
	References {
		/// Document URI.
		uri: String,
		/// Cursor position.
		position: WirePosition,
	},
}

impl EditorOp {
	/// Short name for log events.
	pub fn name(&self) -> &'static str {
		match self {
			Self::Open { .. } => "open",
			Self::Change { .. } => "change",
			Self::Close { .. } => "close",
			Self::Complete { .. } => "complete",
			Self::Define { .. } => "define",
			Self::Hover { .. } => "hover",
			Self::References { .. } => "references",
		}
	}
}

/// A reply from the broker to the editor.
///
/// Language-service failures are never reported here: they arrive as the
/// empty result (`null` or `[]`). `error` is only set for frames the broker
/// could not understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorReply {
	/// Id of the frame being answered; `None` when the frame had no readable id.
	pub id: Option<FrameId>,
	/// Result value.
	#[serde(default)]
	pub result: JsonValue,
	/// Protocol-level error.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl EditorReply {
	/// Successful reply.
	pub fn ok(id: FrameId, result: JsonValue) -> Self {
		Self {
			id: Some(id),
			result,
			error: None,
		}
	}

	/// Reply to a frame the broker could not process.
	pub fn error(id: Option<FrameId>, message: impl Into<String>) -> Self {
		Self {
			id,
			result: JsonValue::Null,
			error: Some(message.into()),
		}
	}
}
