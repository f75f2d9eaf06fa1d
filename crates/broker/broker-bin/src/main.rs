//! Wharf broker daemon.
//!
//! Listens for editor connections and serves each one as an editing session
//! backed by a shared pool of language-server processes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wharf_broker::{BrokerConfig, ProcessLauncher, WorkerPool};

/// Broker command line arguments.
#[derive(Parser, Debug)]
#[command(name = "wharf")]
#[command(about = "Pooled language-server broker for browser editors")]
struct Args {
	/// Config file (defaults to `<config dir>/wharf/wharf.toml`)
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Address to listen on
	#[arg(short, long, value_name = "ADDR")]
	listen: Option<SocketAddr>,

	/// Maximum number of worker processes
	#[arg(short = 'j', long, value_name = "N")]
	max_processes: Option<usize>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let filter = if args.verbose {
		EnvFilter::new("debug")
	} else {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
	};
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let mut config = match &args.config {
		Some(path) => BrokerConfig::load(path)?,
		None => BrokerConfig::load_default()?,
	};
	if let Some(listen) = args.listen {
		config.server.listen = listen;
	}
	if let Some(max) = args.max_processes {
		anyhow::ensure!(max > 0, "--max-processes must be at least 1");
		config.pool.max_processes = max;
	}

	info!(
		command = %config.worker.command,
		max_processes = config.pool.max_processes,
		"Starting wharf"
	);

	let launcher = Arc::new(ProcessLauncher::new(config.worker.clone()));
	let pool = WorkerPool::new(config.pool.clone(), launcher);
	let listener = TcpListener::bind(config.server.listen)
		.await
		.with_context(|| format!("failed to bind {}", config.server.listen))?;

	let shutdown = CancellationToken::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			match tokio::signal::ctrl_c().await {
				Ok(()) => {
					info!("Interrupt received, shutting down");
					shutdown.cancel();
				}
				Err(e) => tracing::warn!(error = %e, "Cannot listen for interrupts"),
			}
		}
	});

	wharf_broker::ipc::serve(listener, pool.clone(), Arc::new(config), shutdown).await?;
	pool.shutdown().await;
	Ok(())
}
