//! Where crawl output and `crawlsink.toml` live when nothing is configured.
//!
//! Each location is picked from the first of: a `CRAWLSINK_*` override, the
//! matching XDG variable plus `crawlsink`, or the platform directory plus
//! `crawlsink`. With no platform directory the current directory is used.

use std::path::PathBuf;

const APP_DIR: &str = "crawlsink";

/// Holds table files, `content/`, `ids.json` and `configuration.json`.
pub fn default_data_dir() -> PathBuf {
  resolve(
    |key| std::env::var_os(key),
    "CRAWLSINK_DATA_DIR",
    "XDG_DATA_HOME",
    dirs::data_local_dir(),
  )
}

pub fn default_config_dir() -> PathBuf {
  resolve(
    |key| std::env::var_os(key),
    "CRAWLSINK_CONFIG_DIR",
    "XDG_CONFIG_HOME",
    dirs::config_dir(),
  )
}

fn resolve<F>(lookup: F, override_var: &str, xdg_var: &str, platform: Option<PathBuf>) -> PathBuf
where
  F: Fn(&str) -> Option<std::ffi::OsString>,
{
  if let Some(dir) = lookup(override_var) {
    return PathBuf::from(dir);
  }
  let base = lookup(xdg_var)
    .map(PathBuf::from)
    .or(platform)
    .unwrap_or_else(|| PathBuf::from("."));
  base.join(APP_DIR)
}
