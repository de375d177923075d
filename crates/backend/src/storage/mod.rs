//! Storage backend capabilities.
//!
//! The coordination core never persists data itself. The listener hands every
//! record to a [`ListenerBackend`]; the aggregator asks an [`AggregatorBackend`]
//! for identifiers and configuration persistence. Each concrete backend
//! implements both halves:
//!
//! - [`MemoryBackend`]: in-memory, inspectable (tests, embedding)
//! - [`LocalBackend`] / [`LocalAggregatorStore`]: JSON-lines files in a data directory

mod local;
mod memory;

use async_trait::async_trait;
pub use local::{LocalAggregatorStore, LocalBackend};
pub use memory::{MemoryBackend, MemoryEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::record::{ContentRecord, CrawlId, Record, VisitId};

#[derive(Debug, Error)]
pub enum BackendError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("Invalid name for {kind}: {name:?}")]
  InvalidName { kind: &'static str, name: String },
}

/// Details about a crawl recorded once by the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlConfiguration {
  pub crawler_version: String,
  pub browser_version: String,
  /// Free-form manager/browser parameters
  #[serde(default)]
  pub parameters: serde_json::Value,
}

/// Listener-side persistence hooks.
///
/// Called only from the listener's single ingestion loop. Errors are not
/// retried; they end the listener.
#[async_trait]
pub trait ListenerBackend: Send {
  /// Persist one structured record. Its visit has already been attributed.
  async fn process_record(&mut self, record: Record) -> Result<(), BackendError>;

  /// Persist a content blob, keyed by its hash. Backends may deduplicate.
  async fn process_content(&mut self, record: ContentRecord) -> Result<(), BackendError>;

  /// `visit_id` will receive no more records. Flush anything buffered for it.
  async fn visit_done(&mut self, visit_id: VisitId, is_shutdown: bool) -> Result<(), BackendError>;

  /// Called once after every open visit has been finalized at shutdown.
  async fn close(&mut self) -> Result<(), BackendError> {
    Ok(())
  }
}

/// Aggregator-side identifier issuance and configuration persistence.
#[async_trait]
pub trait AggregatorBackend: Send + Sync {
  async fn save_configuration(&self, configuration: &CrawlConfiguration) -> Result<(), BackendError>;

  /// A visit id never issued before.
  async fn next_visit_id(&self) -> Result<VisitId, BackendError>;

  /// A crawl id never issued before.
  async fn next_crawl_id(&self) -> Result<CrawlId, BackendError>;
}

/// Names used as file names must stay inside the data directory.
pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<(), BackendError> {
  let valid = !name.is_empty()
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
  if valid {
    Ok(())
  } else {
    Err(BackendError::InvalidName {
      kind,
      name: name.to_string(),
    })
  }
}
