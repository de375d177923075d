use std::{
  collections::{BTreeMap, HashMap},
  path::PathBuf,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, error, trace, warn};

use super::{AggregatorBackend, BackendError, CrawlConfiguration, ListenerBackend, validate_name};
use crate::domain::record::{ContentRecord, CrawlId, Record, VisitId};

const CONTENT_DIR: &str = "content";
const IDS_FILE: &str = "ids.json";
const CONFIGURATION_FILE: &str = "configuration.json";

// ============================================================================
// Listener side
// ============================================================================

/// Writes records as JSON lines, one file per table.
///
/// Records are buffered per visit and written when the visit is done, so a
/// visit's rows land together. Content blobs are stored once under
/// `content/<hash>`.
pub struct LocalBackend {
  dir: PathBuf,
  pending: HashMap<VisitId, Vec<Record>>,
}

impl LocalBackend {
  /// Open (creating if needed) the data directory.
  pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
    let dir = dir.into();
    fs::create_dir_all(dir.join(CONTENT_DIR)).await?;
    Ok(Self {
      dir,
      pending: HashMap::new(),
    })
  }

  /// Path of the JSON-lines file for `table`.
  pub fn table_path(&self, table: &str) -> PathBuf {
    self.dir.join(format!("{}.jsonl", table))
  }

  /// Records buffered for visits that are not done yet.
  pub fn pending_count(&self) -> usize {
    self.pending.values().map(Vec::len).sum()
  }

  async fn write_records(&self, records: &[Record]) -> Result<(), BackendError> {
    let mut by_table: BTreeMap<&str, String> = BTreeMap::new();
    for record in records {
      let line = serde_json::to_string(&record.data)?;
      let buf = by_table.entry(record.table.as_str()).or_default();
      buf.push_str(&line);
      buf.push('\n');
    }

    for (table, lines) in by_table {
      let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(self.table_path(table))
        .await?;
      file.write_all(lines.as_bytes()).await?;
      file.flush().await?;
    }
    Ok(())
  }
}

#[async_trait]
impl ListenerBackend for LocalBackend {
  /// A record whose table cannot be a file name is logged and dropped; the
  /// rest of its visit is unaffected.
  async fn process_record(&mut self, record: Record) -> Result<(), BackendError> {
    if let Err(e) = validate_name("table", &record.table) {
      error!(error = %e, visit_id = ?record.visit_id(), "Dropping record");
      return Ok(());
    }

    match record.visit_id() {
      Some(visit_id) => {
        self.pending.entry(visit_id).or_default().push(record);
        Ok(())
      }
      None => self.write_records(std::slice::from_ref(&record)).await,
    }
  }

  async fn process_content(&mut self, record: ContentRecord) -> Result<(), BackendError> {
    if let Err(e) = validate_name("content hash", &record.content_hash) {
      error!(error = %e, table = %record.table, "Dropping content");
      return Ok(());
    }
    let path = self.dir.join(CONTENT_DIR).join(&record.content_hash);
    if fs::try_exists(&path).await? {
      trace!(hash = %record.content_hash, "Content already stored");
      return Ok(());
    }

    // Write-then-rename so a crash never leaves a truncated blob under its hash.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &record.content).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
  }

  /// Records stay buffered until the write succeeds.
  async fn visit_done(&mut self, visit_id: VisitId, is_shutdown: bool) -> Result<(), BackendError> {
    let Some(records) = self.pending.get(&visit_id) else {
      debug!(visit_id = %visit_id, is_shutdown, "Visit had no buffered records");
      return Ok(());
    };
    debug!(
      visit_id = %visit_id,
      records = records.len(),
      is_shutdown,
      "Flushing visit"
    );
    self.write_records(records).await?;
    self.pending.remove(&visit_id);
    Ok(())
  }

  async fn close(&mut self) -> Result<(), BackendError> {
    if self.pending.is_empty() {
      return Ok(());
    }

    warn!(
      visits = self.pending.len(),
      "Flushing records of visits that were never finalized"
    );
    let records: Vec<Record> = self.pending.values().flatten().cloned().collect();
    self.write_records(&records).await?;
    self.pending.clear();
    Ok(())
  }
}

// ============================================================================
// Aggregator side
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct IssuedIds {
  last_crawl_id: i64,
  last_visit_id: i64,
}

#[derive(Serialize)]
struct SavedConfiguration<'a> {
  #[serde(flatten)]
  configuration: &'a CrawlConfiguration,
  saved_at: DateTime<Utc>,
}

/// Issues identifiers that stay unique across runs sharing a data directory.
pub struct LocalAggregatorStore {
  dir: PathBuf,
  ids: Mutex<IssuedIds>,
}

impl LocalAggregatorStore {
  pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
    let dir = dir.into();
    fs::create_dir_all(&dir).await?;

    let ids = match fs::read(dir.join(IDS_FILE)).await {
      Ok(bytes) => serde_json::from_slice(&bytes)?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => IssuedIds {
        last_crawl_id: 0,
        last_visit_id: 0,
      },
      Err(e) => return Err(e.into()),
    };

    Ok(Self {
      dir,
      ids: Mutex::new(ids),
    })
  }

  async fn persist(&self, ids: &IssuedIds) -> Result<(), BackendError> {
    let tmp = self.dir.join(format!("{}.tmp", IDS_FILE));
    fs::write(&tmp, serde_json::to_vec(ids)?).await?;
    fs::rename(&tmp, self.dir.join(IDS_FILE)).await?;
    Ok(())
  }
}

#[async_trait]
impl AggregatorBackend for LocalAggregatorStore {
  async fn save_configuration(&self, configuration: &CrawlConfiguration) -> Result<(), BackendError> {
    let saved = SavedConfiguration {
      configuration,
      saved_at: Utc::now(),
    };
    fs::write(self.dir.join(CONFIGURATION_FILE), serde_json::to_vec_pretty(&saved)?).await?;
    Ok(())
  }

  async fn next_visit_id(&self) -> Result<VisitId, BackendError> {
    let mut ids = self.ids.lock().await;
    let mut next = *ids;
    next.last_visit_id += 1;
    self.persist(&next).await?;
    *ids = next;
    Ok(VisitId(next.last_visit_id))
  }

  async fn next_crawl_id(&self) -> Result<CrawlId, BackendError> {
    let mut ids = self.ids.lock().await;
    let mut next = *ids;
    next.last_crawl_id += 1;
    self.persist(&next).await?;
    *ids = next;
    Ok(CrawlId(next.last_crawl_id))
  }
}
