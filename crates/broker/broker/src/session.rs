//! Per-session entry point for the editor.
//!
//! A [`SessionFacade`] owns one session's documents and talks to the session's
//! worker through the shared [`WorkerPool`]. Lifecycle calls (`open`, `change`,
//! `close`) never touch the pool; workers are started by the first query.
//!
//! Queries never fail from the editor's point of view. Timeouts, crashes,
//! admission failures and unreadable answers all come back as the empty
//! result for the operation, so a degraded language service never blocks
//! editing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lsp_types::{
	CompletionItem, CompletionResponse, GotoDefinitionResponse, Hover, HoverContents, Location, MarkedString, MarkupContent,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use crate::buffers::{Acquired, BufferRegistry, Released};
use crate::capabilities::client_capabilities;
use crate::config::BrokerConfig;
use crate::document::{DocUri, DocumentClass, Workspace};
use crate::error::{BrokerError, Result};
use crate::pool::{WorkerLease, WorkerPool};
use crate::sync::DocumentSync;
use crate::worker::SessionKey;

/// A 0-based position on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Position {
	/// Line, 0-based.
	pub line: u32,
	/// UTF-16 code unit offset in the line, 0-based.
	pub character: u32,
}

impl Position {
	/// 0-based position.
	pub const fn new(line: u32, character: u32) -> Self {
		Self { line, character }
	}

	/// Convert the 1-based line/column the editor displays.
	pub const fn from_one_based(line: u32, column: u32) -> Self {
		Self::new(line.saturating_sub(1), column.saturating_sub(1))
	}
}

impl From<Position> for lsp_types::Position {
	fn from(pos: Position) -> Self {
		lsp_types::Position::new(pos.line, pos.character)
	}
}

impl From<lsp_types::Position> for Position {
	fn from(pos: lsp_types::Position) -> Self {
		Self::new(pos.line, pos.character)
	}
}

/// Outcome of [`SessionFacade::open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedDocument {
	/// Canonical URI the document is tracked under.
	pub uri: String,
	/// Current local version of the shared buffer.
	pub version: i32,
	/// Live text. Differs from the opened text when another view got there first.
	pub text: String,
	/// Whether another view already had the document open.
	pub shared: bool,
	/// Read-only documents are displayed but never synced to the worker.
	pub read_only: bool,
}

/// Per-session timing knobs, taken from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Deadline for each query.
	pub request_timeout: Duration,
	/// Deadline for the `initialize` request.
	pub init_timeout: Duration,
}

impl SessionSettings {
	/// Settings from the `[worker]` table.
	pub fn from_config(config: &BrokerConfig) -> Self {
		Self {
			request_timeout: config.worker.request_timeout(),
			init_timeout: config.worker.init_timeout(),
		}
	}
}

/// One editing session.
#[derive(Debug)]
pub struct SessionFacade {
	key: SessionKey,
	pool: WorkerPool,
	workspace: Arc<Workspace>,
	sync: DocumentSync,
	settings: SessionSettings,
	closed: AtomicBool,
}

impl SessionFacade {
	/// Session `key` over `pool`, with its own document registry.
	pub fn new(key: SessionKey, pool: WorkerPool, workspace: Arc<Workspace>, config: &BrokerConfig) -> Self {
		let sync = DocumentSync::new(
			Arc::new(BufferRegistry::new()),
			config.worker.language_id.clone(),
			config.sync.debounce(),
		);
		Self {
			key,
			pool,
			workspace,
			sync,
			settings: SessionSettings::from_config(config),
			closed: AtomicBool::new(false),
		}
	}

	/// Session identity.
	pub fn key(&self) -> SessionKey {
		self.key
	}

	/// The session's document coordinator.
	pub fn documents(&self) -> &DocumentSync {
		&self.sync
	}

	/// A view opened `doc` with `text`.
	///
	/// # Errors
	///
	/// [`BrokerError::InvalidUri`] for unparseable identifiers,
	/// [`BrokerError::SessionClosed`] after [`Self::shutdown`].
	pub fn open(&self, doc: &str, text: &str) -> Result<OpenedDocument> {
		self.ensure_open()?;
		let class = self.workspace.classify_str(doc)?;
		let (acquired, read_only) = match &class {
			DocumentClass::Editable(doc) => (self.sync.open(doc, text), false),
			DocumentClass::ReadOnly(uri) => (self.sync.buffers().acquire(uri, text), true),
		};
		let shared = matches!(acquired, Acquired::Shared(_));
		let snapshot = acquired.buffer().snapshot();
		Ok(OpenedDocument {
			uri: class.uri().as_str().to_string(),
			version: snapshot.version,
			text: snapshot.text.to_string(),
			shared,
			read_only,
		})
	}

	/// A view edited `doc`. Returns the new local version, or `None` when the
	/// document is read-only or not open.
	///
	/// # Errors
	///
	/// As for [`Self::open`].
	pub fn change(&self, doc: &str, text: &str) -> Result<Option<i32>> {
		self.ensure_open()?;
		Ok(match self.workspace.classify_str(doc)? {
			DocumentClass::Editable(doc) => self.sync.change(&doc, text),
			DocumentClass::ReadOnly(_) => None,
		})
	}

	/// A view closed `doc`. Returns how many views still hold it.
	///
	/// # Errors
	///
	/// As for [`Self::open`].
	pub fn close(&self, doc: &str) -> Result<usize> {
		self.ensure_open()?;
		let released = match self.workspace.classify_str(doc)? {
			DocumentClass::Editable(doc) => self.sync.close(&doc),
			DocumentClass::ReadOnly(uri) => self.sync.buffers().release(&uri),
		};
		Ok(match released {
			Released::Retained(views) => views,
			Released::Disposed(_) | Released::Untracked => 0,
		})
	}

	/// Completion items at `position`.
	pub async fn complete(&self, doc: &str, position: Position) -> Vec<CompletionItem> {
		let response: Option<CompletionResponse> = self
			.query("textDocument/completion", doc, |uri| position_params(uri, position))
			.await;
		match response {
			Some(CompletionResponse::Array(items)) => items,
			Some(CompletionResponse::List(list)) => list.items,
			None => Vec::new(),
		}
	}

	/// Where the symbol at `position` is defined. The first target wins when
	/// the worker reports several.
	pub async fn define(&self, doc: &str, position: Position) -> Option<Location> {
		let response: GotoDefinitionResponse = self
			.query("textDocument/definition", doc, |uri| position_params(uri, position))
			.await?;
		match response {
			GotoDefinitionResponse::Scalar(location) => Some(location),
			GotoDefinitionResponse::Array(locations) => locations.into_iter().next(),
			GotoDefinitionResponse::Link(links) => links.into_iter().next().map(|link| Location {
				uri: link.target_uri,
				range: link.target_selection_range,
			}),
		}
	}

	/// Hover text at `position`, as markdown.
	pub async fn hover(&self, doc: &str, position: Position) -> Option<String> {
		let hover: Hover = self
			.query("textDocument/hover", doc, |uri| position_params(uri, position))
			.await?;
		Some(format_hover_contents(&hover.contents)).filter(|text| !text.trim().is_empty())
	}

	/// Every reference to the symbol at `position`, declaration included.
	pub async fn find_references(&self, doc: &str, position: Position) -> Vec<Location> {
		self.query("textDocument/references", doc, |uri| {
			let mut params = position_params(uri, position);
			params["context"] = json!({"includeDeclaration": true});
			params
		})
		.await
		.unwrap_or_default()
	}

	/// Tear the session down: stop its worker and refuse further calls.
	///
	/// Documents stay in memory until the facade is dropped.
	pub async fn shutdown(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(worker) = self.pool.worker(self.key) {
			self.sync.detach(worker.id().generation);
		}
		self.pool.terminate(self.key).await;
		debug!(session = %self.key, documents = self.sync.len(), "session.shutdown");
	}

	/// Run one query and absorb its failure into `None`.
	async fn query<T: DeserializeOwned>(
		&self,
		method: &'static str,
		doc: &str,
		params: impl FnOnce(&DocUri) -> JsonValue,
	) -> Option<T> {
		match self.try_query(method, doc, params).await {
			Ok(result) => result,
			Err(err) if err.is_routine() => {
				debug!(session = %self.key, method, error = %err, "session.query.empty");
				None
			}
			Err(err) => {
				warn!(session = %self.key, method, error = %err, "Query failed; returning no result");
				None
			}
		}
	}

	async fn try_query<T: DeserializeOwned>(
		&self,
		method: &'static str,
		doc: &str,
		params: impl FnOnce(&DocUri) -> JsonValue,
	) -> Result<Option<T>> {
		self.ensure_open()?;
		let class = self.workspace.classify_str(doc)?;
		let lease = self.pool.acquire(self.key).await?;
		self.prepare(&lease).await?;
		if let DocumentClass::Editable(doc) = &class {
			self.sync.flush(doc);
		}

		let result = lease
			.request(method, params(class.uri()), self.settings.request_timeout)
			.await?;
		drop(lease);
		Ok(serde_json::from_value::<Option<T>>(result)?)
	}

	/// Handshake once per worker, then make sure it has every open document.
	async fn prepare(&self, lease: &WorkerLease) -> Result<()> {
		lease
			.initialize(|| self.initialize_params(), self.settings.init_timeout)
			.await?;
		let replayed = self.sync.attach(Arc::new(lease.worker().clone()));
		if replayed > 0 {
			debug!(session = %self.key, worker = %lease.id(), replayed, "session.attach");
		}
		Ok(())
	}

	fn initialize_params(&self) -> JsonValue {
		let root_uri = self.workspace.root_uri().map(|uri| uri.to_string());
		let folders = root_uri.as_ref().map(|uri| {
			let name = uri
				.trim_end_matches('/')
				.rsplit('/')
				.next()
				.filter(|s| !s.is_empty())
				.unwrap_or_default();
			vec![json!({"uri": uri, "name": name})]
		});
		json!({
			"processId": std::process::id(),
			"rootPath": self.workspace.root().to_str(),
			"rootUri": root_uri,
			"workspaceFolders": folders,
			"capabilities": client_capabilities(),
			"clientInfo": {"name": "wharf", "version": env!("CARGO_PKG_VERSION")},
		})
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(BrokerError::SessionClosed);
		}
		Ok(())
	}
}

fn position_params(uri: &DocUri, position: Position) -> JsonValue {
	json!({
		"textDocument": {"uri": uri.as_str()},
		"position": position,
	})
}

/// Formats LSP hover contents to markdown.
fn format_hover_contents(contents: &HoverContents) -> String {
	fn marked(part: &MarkedString) -> String {
		match part {
			MarkedString::String(s) => s.clone(),
			MarkedString::LanguageString(ls) => format!("```{}\n{}\n```", ls.language, ls.value),
		}
	}

	match contents {
		HoverContents::Scalar(part) => marked(part),
		HoverContents::Array(parts) => parts.iter().map(marked).collect::<Vec<_>>().join("\n\n"),
		HoverContents::Markup(MarkupContent { value, .. }) => value.clone(),
	}
}
