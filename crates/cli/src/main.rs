//! crawlsink CLI - collects crawl records through a listener process

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

mod commands;
mod logging;

use commands::{cmd_listener, cmd_run, cmd_send, load_config};
use logging::{init_cli_logging, init_listener_logging, init_run_logging};

#[derive(Parser)]
#[command(name = "crawlsink")]
#[command(about = "Aggregates crawl records from browser workers into storage")]
#[command(after_help = "\
QUICK START:
  crawlsink run                   # Start aggregator + listener, print the worker address
  crawlsink send --addr ADDR --crawl-id 1 --visit-id 10 --table http_requests '{\"url\":\"https://example.com\"}'")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Launch a listener and report progress until ctrl-c
  Run {
    /// Config file (default: <config dir>/crawlsink.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Data directory (overrides config)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
  },
  /// Listener process entry point (spawned by `run`)
  #[command(hide = true)]
  Listener {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
  },
  /// Send one record to a running listener
  Send {
    /// Listener address printed by `run`
    #[arg(long)]
    addr: SocketAddr,
    #[arg(long)]
    crawl_id: i64,
    #[arg(long)]
    visit_id: i64,
    /// Destination table
    #[arg(long)]
    table: String,
    /// Extra record fields as a JSON object
    data: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Run { config, data_dir } => {
      let settings = load_config(config.as_deref(), data_dir)?;
      init_run_logging(&settings.logging);
      cmd_run(settings, config).await
    }
    Commands::Listener { config, data_dir } => {
      let settings = load_config(config.as_deref(), data_dir)?;
      let guard = init_listener_logging(&settings.logging);
      let code = match cmd_listener(settings).await {
        Ok(()) => 0,
        Err(e) => {
          error!("{:#}", e);
          1
        }
      };
      drop(guard);
      // The stdin reader may still be parked in a blocking read that runtime
      // shutdown would wait on forever.
      std::process::exit(code)
    }
    Commands::Send {
      addr,
      crawl_id,
      visit_id,
      table,
      data,
    } => {
      init_cli_logging();
      cmd_send(addr, crawl_id, visit_id, &table, data.as_deref()).await
    }
  }
}
