//! Broker configuration.
//!
//! Loaded from a TOML file with four tables. Every key is optional:
//!
//! ```toml
//! [pool]
//! max_processes = 4
//! idle_timeout_secs = 300
//!
//! [sync]
//! debounce_ms = 50
//!
//! [worker]
//! command = "pylsp"
//! language_id = "python"
//! read_only_roots = ["/usr/lib/python3"]
//!
//! [server]
//! listen = "127.0.0.1:7878"
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wharf_rpc::Framing;

/// File name looked up under the user's config directory.
pub const CONFIG_FILE: &str = "wharf.toml";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The file exists but could not be read.
	#[error("cannot read {path}: {source}")]
	Read {
		/// File that failed.
		path: PathBuf,
		/// Underlying error.
		source: std::io::Error,
	},
	/// The file is not valid TOML for this schema.
	#[error("cannot parse {path}: {source}")]
	Parse {
		/// File that failed.
		path: PathBuf,
		/// Underlying error.
		source: toml::de::Error,
	},
	/// Values parsed but are unusable.
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
	/// Worker pool limits and timers.
	pub pool: PoolConfig,
	/// Document synchronization.
	pub sync: SyncConfig,
	/// How workers are launched and talked to.
	pub worker: WorkerConfig,
	/// Editor-facing listener.
	pub server: ServerConfig,
}

/// `[pool]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
	/// Maximum number of live or starting workers.
	pub max_processes: usize,
	/// Idle time after which a worker may be reclaimed for another session.
	pub reclaim_after_secs: u64,
	/// Idle time after which the sweep terminates a worker.
	pub idle_timeout_secs: u64,
	/// Period of the idle sweep.
	pub sweep_interval_secs: u64,
	/// How long a queued acquire waits for a slot.
	pub admission_timeout_secs: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			max_processes: 4,
			reclaim_after_secs: 60,
			idle_timeout_secs: 300,
			sweep_interval_secs: 60,
			admission_timeout_secs: 30,
		}
	}
}

impl PoolConfig {
	/// Idle threshold for reclamation under pressure.
	pub fn reclaim_after(&self) -> Duration {
		Duration::from_secs(self.reclaim_after_secs)
	}

	/// Idle threshold for the sweep.
	pub fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.idle_timeout_secs)
	}

	/// Sweep period. Never zero.
	pub fn sweep_interval(&self) -> Duration {
		Duration::from_secs(self.sweep_interval_secs.max(1))
	}

	/// Queue deadline.
	pub fn admission_timeout(&self) -> Duration {
		Duration::from_secs(self.admission_timeout_secs)
	}
}

/// `[sync]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
	/// Quiet period before a change is sent to the worker.
	pub debounce_ms: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self { debounce_ms: 50 }
	}
}

impl SyncConfig {
	/// Debounce window.
	pub fn debounce(&self) -> Duration {
		Duration::from_millis(self.debounce_ms)
	}
}

/// `[worker]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
	/// Program to run.
	pub command: String,
	/// Arguments.
	pub args: Vec<String>,
	/// Extra environment variables.
	pub env: BTreeMap<String, String>,
	/// Workspace root. Defaults to the broker's working directory.
	pub root: Option<PathBuf>,
	/// `languageId` sent with `didOpen`.
	pub language_id: String,
	/// Stdio framing.
	pub framing: Framing,
	/// Deadline for editor-driven requests.
	pub request_timeout_ms: u64,
	/// Deadline for the `initialize` handshake.
	pub init_timeout_secs: u64,
	/// Directories whose documents are never synchronized to the worker.
	pub read_only_roots: Vec<PathBuf>,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			command: "pylsp".into(),
			args: Vec::new(),
			env: BTreeMap::new(),
			root: None,
			language_id: "python".into(),
			framing: Framing::ContentLength,
			request_timeout_ms: 5000,
			init_timeout_secs: 30,
			read_only_roots: Vec::new(),
		}
	}
}

impl WorkerConfig {
	/// Deadline for editor-driven requests.
	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms)
	}

	/// Deadline for the handshake.
	pub fn init_timeout(&self) -> Duration {
		Duration::from_secs(self.init_timeout_secs)
	}

	/// The configured root, or the current directory.
	pub fn root_dir(&self) -> PathBuf {
		match &self.root {
			Some(root) => root.clone(),
			None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
		}
	}
}

/// `[server]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
	/// Address the editor connects to.
	pub listen: SocketAddr,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: SocketAddr::from(([127, 0, 0, 1], 7878)),
		}
	}
}

impl BrokerConfig {
	/// Parse configuration from a TOML string.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::Parse`] for bad TOML and
	/// [`ConfigError::Invalid`] for unusable values.
	pub fn from_toml(source: &str, origin: &Path) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(source).map_err(|source| ConfigError::Parse {
			path: origin.to_path_buf(),
			source,
		})?;
		config.validate()?;
		Ok(config)
	}

	/// Load configuration from `path`.
	///
	/// # Errors
	///
	/// Fails if the file cannot be read or parsed.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml(&source, path)
	}

	/// Load from the user config directory, or fall back to defaults when no
	/// file exists there.
	///
	/// # Errors
	///
	/// Fails only if a file exists but is unreadable or invalid.
	pub fn load_default() -> Result<Self, ConfigError> {
		match default_path() {
			Some(path) if path.exists() => Self::load(&path),
			_ => Ok(Self::default()),
		}
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.pool.max_processes == 0 {
			return Err(ConfigError::Invalid("pool.max_processes must be at least 1".into()));
		}
		if self.worker.command.trim().is_empty() {
			return Err(ConfigError::Invalid("worker.command is empty".into()));
		}
		Ok(())
	}
}

/// `<config dir>/wharf/wharf.toml`, if the platform has a config directory.
pub fn default_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("wharf").join(CONFIG_FILE))
}
