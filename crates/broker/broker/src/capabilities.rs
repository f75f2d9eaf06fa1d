//! Client capabilities advertised in the `initialize` handshake.

use lsp_types::{
	ClientCapabilities, CompletionClientCapabilities, CompletionItemCapability, DynamicRegistrationClientCapabilities,
	GeneralClientCapabilities, GotoCapability, HoverClientCapabilities, MarkupKind, PositionEncodingKind,
	TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities, WorkspaceClientCapabilities,
};

/// Capabilities for the operations the broker forwards: full-text sync,
/// completion, definition, hover and references.
pub fn client_capabilities() -> ClientCapabilities {
	ClientCapabilities {
		workspace: Some(WorkspaceClientCapabilities {
			workspace_folders: Some(true),
			configuration: Some(false),
			..Default::default()
		}),
		text_document: Some(TextDocumentClientCapabilities {
			synchronization: Some(TextDocumentSyncClientCapabilities {
				dynamic_registration: Some(false),
				will_save: Some(false),
				will_save_wait_until: Some(false),
				did_save: Some(false),
			}),
			completion: Some(CompletionClientCapabilities {
				completion_item: Some(CompletionItemCapability {
					snippet_support: Some(false),
					documentation_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
					deprecated_support: Some(true),
					..Default::default()
				}),
				context_support: Some(false),
				..Default::default()
			}),
			hover: Some(HoverClientCapabilities {
				content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
				..Default::default()
			}),
			definition: Some(GotoCapability {
				dynamic_registration: Some(false),
				link_support: Some(true),
			}),
			references: Some(DynamicRegistrationClientCapabilities {
				dynamic_registration: Some(false),
			}),
			..Default::default()
		}),
		general: Some(GeneralClientCapabilities {
			position_encodings: Some(vec![PositionEncodingKind::UTF16]),
			..Default::default()
		}),
		..Default::default()
	}
}
