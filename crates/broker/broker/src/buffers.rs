//! Reference-counted registry of shared document buffers.
//!
//! Every view that displays a document holds one reference. The first view
//! creates the buffer; later views attach to the live buffer and the text they
//! brought is ignored. The buffer is disposed when the last view lets go.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use ropey::Rope;

use crate::document::DocUri;

/// Content of a buffer at one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
	/// Full text.
	pub text: Rope,
	/// Local version; starts at 0 and grows by one per update.
	pub version: i32,
}

impl Snapshot {
	/// Content fingerprint, used to skip notifications that would not change
	/// anything on the worker.
	pub fn fingerprint(&self) -> u64 {
		let mut hasher = xxhash_rust::xxh3::Xxh3::new();
		for chunk in self.text.chunks() {
			hasher.update(chunk.as_bytes());
		}
		hasher.digest()
	}
}

#[derive(Debug)]
struct BufferState {
	text: Rope,
	version: i32,
}

/// Handle to one live buffer. Clones refer to the same text.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
	state: Arc<RwLock<BufferState>>,
}

impl SharedBuffer {
	fn new(text: &str) -> Self {
		Self {
			state: Arc::new(RwLock::new(BufferState {
				text: Rope::from_str(text),
				version: 0,
			})),
		}
	}

	/// Current text and version.
	pub fn snapshot(&self) -> Snapshot {
		let state = self.state.read();
		Snapshot {
			text: state.text.clone(),
			version: state.version,
		}
	}

	/// Current text.
	pub fn text(&self) -> String {
		self.state.read().text.to_string()
	}

	/// Current version.
	pub fn version(&self) -> i32 {
		self.state.read().version
	}

	/// Whether two handles point at the same buffer.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.state, &other.state)
	}

	fn replace(&self, text: &str) -> i32 {
		let mut state = self.state.write();
		state.text = Rope::from_str(text);
		state.version += 1;
		state.version
	}
}

/// Result of [`BufferRegistry::acquire`].
#[derive(Debug, Clone)]
pub enum Acquired {
	/// First reference; the buffer was created from the caller's text.
	Created(SharedBuffer),
	/// The document was already open; the caller shares the live buffer.
	Shared(SharedBuffer),
}

impl Acquired {
	/// The buffer either way.
	pub fn buffer(&self) -> &SharedBuffer {
		match self {
			Self::Created(buffer) | Self::Shared(buffer) => buffer,
		}
	}
}

/// Result of [`BufferRegistry::release`].
#[derive(Debug, Clone)]
pub enum Released {
	/// Other views still hold the buffer.
	Retained(usize),
	/// That was the last reference; the buffer is gone from the registry.
	Disposed(SharedBuffer),
	/// The document was not open.
	Untracked,
}

#[derive(Debug)]
struct Entry {
	buffer: SharedBuffer,
	refcount: usize,
}

/// All open documents, keyed by canonical URI.
#[derive(Debug, Default)]
pub struct BufferRegistry {
	entries: Mutex<HashMap<DocUri, Entry>>,
}

impl BufferRegistry {
	/// An empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Take a reference to `uri`, creating the buffer from `text` if this is
	/// the first one.
	pub fn acquire(&self, uri: &DocUri, text: &str) -> Acquired {
		let mut entries = self.entries.lock();
		if let Some(entry) = entries.get_mut(uri) {
			entry.refcount += 1;
			tracing::trace!(%uri, refcount = entry.refcount, "buffer.shared");
			return Acquired::Shared(entry.buffer.clone());
		}

		let buffer = SharedBuffer::new(text);
		entries.insert(
			uri.clone(),
			Entry {
				buffer: buffer.clone(),
				refcount: 1,
			},
		);
		tracing::trace!(%uri, "buffer.created");
		Acquired::Created(buffer)
	}

	/// Drop one reference to `uri`.
	pub fn release(&self, uri: &DocUri) -> Released {
		let mut entries = self.entries.lock();
		let Some(entry) = entries.get_mut(uri) else {
			return Released::Untracked;
		};
		entry.refcount -= 1;
		if entry.refcount > 0 {
			return Released::Retained(entry.refcount);
		}
		let entry = entries.remove(uri);
		tracing::trace!(%uri, "buffer.disposed");
		match entry {
			Some(entry) => Released::Disposed(entry.buffer),
			None => Released::Untracked,
		}
	}

	/// Replace the text of an open buffer. Returns the new version, or `None`
	/// if the document is not open.
	pub fn update(&self, uri: &DocUri, text: &str) -> Option<i32> {
		let buffer = self.entries.lock().get(uri).map(|entry| entry.buffer.clone())?;
		Some(buffer.replace(text))
	}

	/// The live buffer for `uri`.
	pub fn get(&self, uri: &DocUri) -> Option<SharedBuffer> {
		self.entries.lock().get(uri).map(|entry| entry.buffer.clone())
	}

	/// Current text and version of `uri`.
	pub fn snapshot(&self, uri: &DocUri) -> Option<Snapshot> {
		self.get(uri).map(|buffer| buffer.snapshot())
	}

	/// Number of views holding `uri`; 0 when closed.
	pub fn refcount(&self, uri: &DocUri) -> usize {
		self.entries.lock().get(uri).map_or(0, |entry| entry.refcount)
	}

	/// Whether `uri` is open in at least one view.
	pub fn contains(&self, uri: &DocUri) -> bool {
		self.entries.lock().contains_key(uri)
	}

	/// Number of open documents.
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	/// Whether no document is open.
	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn uri(path: &str) -> DocUri {
		DocUri::parse(path).unwrap()
	}

	#[test]
	fn second_view_shares_the_live_buffer() {
		let registry = BufferRegistry::new();
		let doc = uri("/ws/a.py");

		let Acquired::Created(first) = registry.acquire(&doc, "x = 1") else {
			panic!("first acquire must create");
		};
		let Acquired::Shared(second) = registry.acquire(&doc, "stale") else {
			panic!("second acquire must share");
		};

		assert!(first.ptr_eq(&second));
		assert_eq!(second.text(), "x = 1");
		assert_eq!(registry.refcount(&doc), 2);
	}

	#[test]
	fn buffer_survives_until_last_release() {
		let registry = BufferRegistry::new();
		let doc = uri("/ws/a.py");
		registry.acquire(&doc, "");
		registry.acquire(&doc, "");

		assert!(matches!(registry.release(&doc), Released::Retained(1)));
		assert!(registry.contains(&doc));
		assert!(matches!(registry.release(&doc), Released::Disposed(_)));
		assert!(!registry.contains(&doc));
		assert!(matches!(registry.release(&doc), Released::Untracked));
		assert!(registry.is_empty());
	}

	#[test]
	fn updates_bump_the_version_and_last_writer_wins() {
		let registry = BufferRegistry::new();
		let doc = uri("/ws/a.py");
		registry.acquire(&doc, "a");

		assert_eq!(registry.update(&doc, "b"), Some(1));
		assert_eq!(registry.update(&doc, "c"), Some(2));
		let snapshot = registry.snapshot(&doc).unwrap();
		assert_eq!(snapshot.text.to_string(), "c");
		assert_eq!(snapshot.version, 2);

		assert_eq!(registry.update(&uri("/ws/closed.py"), "z"), None);
	}

	#[test]
	fn fingerprint_tracks_content_not_version() {
		let registry = BufferRegistry::new();
		let doc = uri("/ws/a.py");
		registry.acquire(&doc, "same");
		let before = registry.snapshot(&doc).unwrap().fingerprint();
		registry.update(&doc, "same");
		let after = registry.snapshot(&doc).unwrap();

		assert_eq!(after.version, 1);
		assert_eq!(after.fingerprint(), before);
	}
}
