//! CLI command implementations

mod listener;
mod run;
mod send;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crawlsink::config::Config;
pub use listener::cmd_listener;
pub use run::cmd_run;
pub use send::cmd_send;

/// Load the config file and apply command-line overrides.
pub fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Config> {
  let mut config = Config::load_or_default(path).context("Failed to load config")?;
  if let Some(dir) = data_dir {
    config.storage.data_dir = dir;
  }
  Ok(config)
}
