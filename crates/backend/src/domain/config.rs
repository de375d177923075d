//! Configuration for the aggregator and its listener process.
//!
//! Config is read from a TOML file (`crawlsink.toml` in the config dir by
//! default). Every field has a default, so an empty or missing file yields a
//! working configuration.

use std::{
  net::SocketAddr,
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dirs;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("IO error reading {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid config {path:?}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub aggregator: AggregatorSettings,
  pub listener: ListenerSettings,
  pub storage: StorageSettings,
  pub logging: LoggingSettings,
}

impl Config {
  /// Load config from `path`. A missing file yields defaults.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = match std::fs::read_to_string(path) {
      Ok(c) => c,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(source) => {
        return Err(ConfigError::Io {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Load from an explicit path if given, otherwise from the default location.
  pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
    match path {
      Some(p) => Self::load(p),
      None => Self::load(&Self::default_path()),
    }
  }

  /// Default config file location
  pub fn default_path() -> PathBuf {
    dirs::default_config_dir().join("crawlsink.toml")
  }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Manager-side timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSettings {
  /// Seconds without a status sample before the listener is considered unresponsive
  /// Default: 120
  #[serde(default = "default_status_timeout_secs")]
  pub status_timeout_secs: u64,

  /// Seconds to wait for the listener to exit after requesting shutdown
  /// Default: 300
  #[serde(default = "default_shutdown_timeout_secs")]
  pub shutdown_timeout_secs: u64,
}

fn default_status_timeout_secs() -> u64 {
  120
}
fn default_shutdown_timeout_secs() -> u64 {
  300
}

impl Default for AggregatorSettings {
  fn default() -> Self {
    Self {
      status_timeout_secs: default_status_timeout_secs(),
      shutdown_timeout_secs: default_shutdown_timeout_secs(),
    }
  }
}

impl AggregatorSettings {
  pub fn status_timeout(&self) -> Duration {
    Duration::from_secs(self.status_timeout_secs)
  }

  pub fn shutdown_timeout(&self) -> Duration {
    Duration::from_secs(self.shutdown_timeout_secs)
  }
}

// ============================================================================
// Listener
// ============================================================================

/// Listener-side transport and pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerSettings {
  /// Address the record transport binds to (port 0 = ephemeral)
  #[serde(default = "default_bind_addr")]
  pub bind_addr: SocketAddr,

  /// Minimum seconds between queue-depth status samples
  /// Default: 5
  #[serde(default = "default_status_update_interval_secs")]
  pub status_update_interval_secs: u64,

  /// Longest the ingestion loop waits for a record before re-checking shutdown
  /// Default: 1000
  #[serde(default = "default_record_poll_interval_ms")]
  pub record_poll_interval_ms: u64,

  /// Seconds a worker connection gets to reach EOF after shutdown starts
  /// before it is cut off
  /// Default: 3
  #[serde(default = "default_drain_timeout_secs")]
  pub drain_timeout_secs: u64,
}

fn default_bind_addr() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 0))
}
fn default_status_update_interval_secs() -> u64 {
  5
}
fn default_record_poll_interval_ms() -> u64 {
  1000
}
fn default_drain_timeout_secs() -> u64 {
  3
}

impl Default for ListenerSettings {
  fn default() -> Self {
    Self {
      bind_addr: default_bind_addr(),
      status_update_interval_secs: default_status_update_interval_secs(),
      record_poll_interval_ms: default_record_poll_interval_ms(),
      drain_timeout_secs: default_drain_timeout_secs(),
    }
  }
}

impl ListenerSettings {
  pub fn status_update_interval(&self) -> Duration {
    Duration::from_secs(self.status_update_interval_secs)
  }

  pub fn record_poll_interval(&self) -> Duration {
    Duration::from_millis(self.record_poll_interval_ms)
  }

  pub fn drain_timeout(&self) -> Duration {
    Duration::from_secs(self.drain_timeout_secs)
  }
}

// ============================================================================
// Storage / Logging
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
  /// Directory the local backend writes to
  #[serde(default = "dirs::default_data_dir")]
  pub data_dir: PathBuf,
}

impl Default for StorageSettings {
  fn default() -> Self {
    Self {
      data_dir: dirs::default_data_dir(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  #[serde(default = "default_log_level")]
  pub level: String,

  /// Optional directory for a daily-rotated log file (listener process only)
  #[serde(default)]
  pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Default for LoggingSettings {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      log_dir: None,
    }
  }
}
