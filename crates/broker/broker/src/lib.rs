//! Wharf broker: pooled language-server workers behind per-session facades.
//!
//! Many editing sessions share a bounded [`WorkerPool`] of worker processes.
//! Each session's documents live in a reference-counted
//! [`BufferRegistry`](buffers::BufferRegistry) and reach the worker through a
//! [`DocumentSync`] coordinator, which sends one `didOpen` per worker lifetime,
//! debounced `didChange`s and a single `didClose`, however many views show the
//! document. [`SessionFacade`] ties these together for the editor, and
//! [`ipc::serve`] exposes sessions over TCP.

#![warn(missing_docs)]

pub mod buffers;
pub mod capabilities;
pub mod config;
pub mod document;
pub mod error;
pub mod ipc;
pub mod launcher;
pub mod pool;
pub mod session;
pub mod sync;
pub mod worker;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
#[doc(hidden)]
pub use launcher::test_helpers;
pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use pool::{PoolStats, WorkerLease, WorkerPool};
pub use session::{OpenedDocument, Position, SessionFacade};
pub use sync::DocumentSync;
pub use wharf_broker_proto as proto;
pub use worker::{SessionKey, WorkerHandle, WorkerId};
