use std::{
  collections::BTreeMap,
  sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{AggregatorBackend, BackendError, CrawlConfiguration, ListenerBackend};
use crate::domain::record::{ContentRecord, CrawlId, Record, VisitId};

/// Something the memory backend was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
  Record { table: String, visit_id: Option<VisitId> },
  Content { content_hash: String },
  VisitDone { visit_id: VisitId, is_shutdown: bool },
  Closed,
}

#[derive(Debug, Default)]
struct MemoryState {
  records: Vec<Record>,
  content: BTreeMap<String, Vec<u8>>,
  events: Vec<MemoryEvent>,
  last_visit_id: i64,
  last_crawl_id: i64,
}

/// In-memory backend. Clones share state, so a test can keep one clone while
/// the listener owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
  state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, MemoryState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Every record persisted so far.
  pub fn records(&self) -> Vec<Record> {
    self.state().records.clone()
  }

  /// Records persisted for one visit.
  pub fn records_for(&self, visit_id: VisitId) -> Vec<Record> {
    self
      .state()
      .records
      .iter()
      .filter(|r| r.visit_id() == Some(visit_id))
      .cloned()
      .collect()
  }

  pub fn content(&self, content_hash: &str) -> Option<Vec<u8>> {
    self.state().content.get(content_hash).cloned()
  }

  pub fn content_count(&self) -> usize {
    self.state().content.len()
  }

  /// The full call log.
  pub fn events(&self) -> Vec<MemoryEvent> {
    self.state().events.clone()
  }

  /// `(visit_id, is_shutdown)` for every `visit_done` call, in order.
  pub fn finished_visits(&self) -> Vec<(VisitId, bool)> {
    self
      .state()
      .events
      .iter()
      .filter_map(|e| match e {
        MemoryEvent::VisitDone { visit_id, is_shutdown } => Some((*visit_id, *is_shutdown)),
        _ => None,
      })
      .collect()
  }
}

#[async_trait]
impl ListenerBackend for MemoryBackend {
  async fn process_record(&mut self, record: Record) -> Result<(), BackendError> {
    let mut state = self.state();
    state.events.push(MemoryEvent::Record {
      table: record.table.clone(),
      visit_id: record.visit_id(),
    });
    state.records.push(record);
    Ok(())
  }

  async fn process_content(&mut self, record: ContentRecord) -> Result<(), BackendError> {
    let mut state = self.state();
    state.events.push(MemoryEvent::Content {
      content_hash: record.content_hash.clone(),
    });
    state.content.entry(record.content_hash).or_insert(record.content);
    Ok(())
  }

  async fn visit_done(&mut self, visit_id: VisitId, is_shutdown: bool) -> Result<(), BackendError> {
    self.state().events.push(MemoryEvent::VisitDone { visit_id, is_shutdown });
    Ok(())
  }

  async fn close(&mut self) -> Result<(), BackendError> {
    self.state().events.push(MemoryEvent::Closed);
    Ok(())
  }
}

#[async_trait]
impl AggregatorBackend for MemoryBackend {
  /// Nothing to keep between runs.
  async fn save_configuration(&self, _configuration: &CrawlConfiguration) -> Result<(), BackendError> {
    Ok(())
  }

  async fn next_visit_id(&self) -> Result<VisitId, BackendError> {
    let mut state = self.state();
    state.last_visit_id += 1;
    Ok(VisitId(state.last_visit_id))
  }

  async fn next_crawl_id(&self) -> Result<CrawlId, BackendError> {
    let mut state = self.state();
    state.last_crawl_id += 1;
    Ok(CrawlId(state.last_crawl_id))
  }
}
