//! Run command: aggregator in this process, listener in a child

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use crawlsink::{Aggregator, ProcessLauncher, ShutdownOutcome, config::Config, storage::LocalAggregatorStore};
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Launch the listener and report progress until ctrl-c
pub async fn cmd_run(config: Config, config_path: Option<PathBuf>) -> Result<()> {
  let data_dir = config.storage.data_dir.clone();
  let store = LocalAggregatorStore::open(&data_dir)
    .await
    .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
  let mut aggregator = Aggregator::new(store, config.aggregator.clone());

  let mut launcher = ProcessLauncher::current_exe()
    .context("Failed to locate the crawlsink binary")?
    .arg("listener")
    .arg("--data-dir")
    .arg(&data_dir);
  if let Some(path) = config_path {
    launcher = launcher.arg("--config").arg(path);
  }

  let addr = aggregator.launch(launcher).await.context("Failed to launch listener")?;
  info!(%addr, data_dir = %data_dir.display(), "Listener ready");
  println!("Workers can send records to {}", addr);
  println!("Press Ctrl+C to stop");

  let mut ticker = tokio::time::interval(config.listener.status_update_interval());
  ticker.tick().await;

  let ctrl_c = signal::ctrl_c();
  tokio::pin!(ctrl_c);

  let mut saved_total = 0usize;
  loop {
    tokio::select! {
      result = &mut ctrl_c => {
        if let Err(e) = result {
          warn!("Failed to listen for ctrl-c: {}", e);
        }
        info!("Received ctrl-c, shutting down...");
        break;
      }
      _ = ticker.tick() => {
        match aggregator.get_most_recent_status().await {
          Ok(depth) => debug!(depth, "Listener queue"),
          Err(e) => {
            error!("Listener is unhealthy: {}", e);
            break;
          }
        }

        let saved = aggregator.get_saved_visit_ids();
        if !saved.is_empty() {
          saved_total += saved.len();
          info!(count = saved.len(), total = saved_total, "Visits saved: {:?}", saved);
        }
      }
    }
  }

  let outcome = aggregator.shutdown().await.context("Failed to shut down listener")?;
  let saved = aggregator.get_saved_visit_ids();
  saved_total += saved.len();
  if !saved.is_empty() {
    info!(count = saved.len(), "Visits saved during shutdown: {:?}", saved);
  }

  match outcome {
    ShutdownOutcome::Stopped { elapsed } => {
      info!(?elapsed, total = saved_total, "Listener stopped");
      Ok(())
    }
    ShutdownOutcome::Failed { elapsed, reason } => {
      bail!("Listener failed after {:?}: {}", elapsed, reason)
    }
    ShutdownOutcome::TimedOut { waited, killed } => {
      bail!("Listener did not stop within {:?} (killed: {})", waited, killed)
    }
  }
}
