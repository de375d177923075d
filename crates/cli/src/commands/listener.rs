//! Listener child process

use anyhow::{Context, Result};
use crawlsink::{config::Config, run_stdio_listener, storage::LocalBackend};
use tokio::signal;
use tracing::{info, warn};

/// Run the listener with control channels on stdin/stdout
pub async fn cmd_listener(config: Config) -> Result<()> {
  let data_dir = &config.storage.data_dir;
  let backend = LocalBackend::open(data_dir)
    .await
    .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

  // Shutdown arrives on the control channel; a terminal ctrl-c must not cut
  // the drain short.
  tokio::spawn(ignore_ctrl_c());

  info!(data_dir = %data_dir.display(), "Starting listener");
  run_stdio_listener(backend, config.listener).await.context("Listener failed")?;

  Ok(())
}

async fn ignore_ctrl_c() {
  loop {
    match signal::ctrl_c().await {
      Ok(()) => info!("Ignoring ctrl-c; waiting for shutdown from aggregator"),
      Err(e) => {
        warn!("Failed to listen for ctrl-c: {}", e);
        return;
      }
    }
  }
}
