//! Document identity and classification.
//!
//! Documents reach the broker as URIs or absolute paths. They are
//! canonicalized once into a [`DocUri`] and then classified against the
//! workspace: only [`EditableUri`]s may be synchronized to a worker, and the
//! sync coordinator accepts nothing else.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::config::WorkerConfig;
use crate::error::{BrokerError, Result};

/// A canonical document URI.
///
/// `file:///ws/./a/../b.py` and `/ws/b.py` both become `file:///ws/b.py`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocUri(Url);

impl DocUri {
	/// Canonicalize a URI or absolute filesystem path.
	///
	/// # Errors
	///
	/// [`BrokerError::InvalidUri`] for relative paths and unparsable URIs.
	pub fn parse(raw: &str) -> Result<Self> {
		let invalid = || BrokerError::InvalidUri(raw.to_string());
		let url = if raw.contains("://") {
			Url::parse(raw).map_err(|_| invalid())?
		} else {
			let url = Url::from_file_path(raw).map_err(|_| invalid())?;
			// Re-parsing resolves `..` segments the path conversion keeps.
			Url::parse(url.as_str()).map_err(|_| invalid())?
		};
		Ok(Self(url))
	}

	/// The URI string sent to workers.
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}

	/// The underlying URL.
	pub fn url(&self) -> &Url {
		&self.0
	}

	/// Local path for `file:` URIs.
	pub fn to_file_path(&self) -> Option<PathBuf> {
		if self.0.scheme() != "file" {
			return None;
		}
		self.0.to_file_path().ok()
	}
}

impl fmt::Display for DocUri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A document that may be edited and synchronized to a worker.
///
/// Only [`Workspace::classify`] constructs these.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EditableUri(DocUri);

impl EditableUri {
	/// The canonical URI.
	pub fn uri(&self) -> &DocUri {
		&self.0
	}
}

impl fmt::Display for EditableUri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Outcome of classifying a document against the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentClass {
	/// Inside the workspace and outside every read-only root.
	Editable(EditableUri),
	/// Displayed only; never opened on a worker.
	ReadOnly(DocUri),
}

impl DocumentClass {
	/// The canonical URI regardless of class.
	pub fn uri(&self) -> &DocUri {
		match self {
			Self::Editable(editable) => editable.uri(),
			Self::ReadOnly(uri) => uri,
		}
	}
}

/// Where editable documents live.
#[derive(Debug, Clone)]
pub struct Workspace {
	root: PathBuf,
	read_only_roots: Vec<PathBuf>,
}

impl Workspace {
	/// Workspace rooted at `root`, with `read_only_roots` carved out of it.
	///
	/// Relative roots are resolved against the current directory.
	pub fn new(root: impl Into<PathBuf>, read_only_roots: Vec<PathBuf>) -> Self {
		Self {
			root: absolutize(root.into()),
			read_only_roots: read_only_roots.into_iter().map(absolutize).collect(),
		}
	}

	/// Workspace described by the `[worker]` table.
	pub fn from_config(config: &WorkerConfig) -> Self {
		Self::new(config.root_dir(), config.read_only_roots.clone())
	}

	/// Root directory.
	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Root as a `file:` URI, for the initialize handshake.
	pub fn root_uri(&self) -> Option<Url> {
		Url::from_directory_path(&self.root).ok()
	}

	/// Decide whether `uri` is editable.
	pub fn classify(&self, uri: DocUri) -> DocumentClass {
		match uri.to_file_path() {
			Some(path) if path.starts_with(&self.root) && !self.read_only_roots.iter().any(|ro| path.starts_with(ro)) => {
				DocumentClass::Editable(EditableUri(uri))
			}
			_ => DocumentClass::ReadOnly(uri),
		}
	}

	/// Parse and classify in one step.
	///
	/// # Errors
	///
	/// See [`DocUri::parse`].
	pub fn classify_str(&self, raw: &str) -> Result<DocumentClass> {
		DocUri::parse(raw).map(|uri| self.classify(uri))
	}
}

/// Make `path` absolute and resolve `.` and `..` lexically, the same way
/// [`DocUri::parse`] treats document paths.
fn absolutize(path: PathBuf) -> PathBuf {
	let path = std::path::absolute(&path).unwrap_or(path);
	let mut out = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				out.pop();
			}
			other => out.push(other),
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn workspace() -> Workspace {
		Workspace::new("/ws", vec![PathBuf::from("/ws/.venv")])
	}

	#[test]
	fn paths_and_uris_canonicalize_to_the_same_key() {
		let a = DocUri::parse("/ws/pkg/../main.py").unwrap();
		let b = DocUri::parse("file:///ws/./main.py").unwrap();
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "file:///ws/main.py");
	}

	#[test]
	fn relative_paths_are_rejected() {
		assert!(matches!(DocUri::parse("main.py"), Err(BrokerError::InvalidUri(_))));
	}

	#[test]
	fn classification_respects_root_and_read_only_roots() {
		let ws = workspace();
		assert!(matches!(ws.classify_str("file:///ws/main.py").unwrap(), DocumentClass::Editable(_)));
		assert!(matches!(
			ws.classify_str("file:///ws/.venv/lib/site.py").unwrap(),
			DocumentClass::ReadOnly(_)
		));
		assert!(matches!(
			ws.classify_str("file:///usr/lib/python3/os.py").unwrap(),
			DocumentClass::ReadOnly(_)
		));
		assert!(matches!(ws.classify_str("untitled://scratch").unwrap(), DocumentClass::ReadOnly(_)));
	}

	#[test]
	fn root_uri_is_a_directory_url() {
		assert_eq!(workspace().root_uri().unwrap().as_str(), "file:///ws/");
	}

	#[test]
	fn relative_roots_resolve_against_the_working_directory() {
		let cwd = std::env::current_dir().unwrap();
		let ws = Workspace::new("ws", vec![PathBuf::from("ws/./.venv")]);
		assert_eq!(ws.root(), cwd.join("ws"));

		let main = cwd.join("ws").join("main.py");
		let class = ws.classify_str(main.to_str().unwrap()).unwrap();
		assert!(matches!(class, DocumentClass::Editable(_)));

		let vendored = cwd.join("ws").join(".venv").join("site.py");
		let class = ws.classify_str(vendored.to_str().unwrap()).unwrap();
		assert!(matches!(class, DocumentClass::ReadOnly(_)));

		let root_uri = ws.root_uri().unwrap();
		assert!(root_uri.as_str().ends_with("/ws/"));
	}

	#[test]
	fn parent_segments_in_roots_are_resolved() {
		let ws = Workspace::new("/srv/pkg/../ws", Vec::new());
		assert_eq!(ws.root(), Path::new("/srv/ws"));
		assert!(matches!(ws.classify_str("/srv/ws/main.py").unwrap(), DocumentClass::Editable(_)));
	}
}
