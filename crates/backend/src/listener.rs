//! The listener: ingests worker records and reports back to the aggregator.
//!
//! # Lifecycle
//!
//! ```text
//! Init ──startup──> Running ──(shutdown requested)──> Draining ──shutdown──> Terminated
//! ```
//!
//! 1. `startup` binds the record transport and publishes its address on the
//!    status channel (the rendezvous)
//! 2. The ingestion loop polls the shutdown channel, publishes throttled
//!    queue-depth samples and processes one record per iteration
//! 3. `drain_queue` stops accepting workers, lets each open connection read
//!    to EOF (bounded by `drain_timeout`), then processes whatever is left in
//!    the queue
//! 4. `shutdown` finalizes every visit still open
//!
//! # Visit grouping
//!
//! Each crawl (browser instance) produces records for one visit at a time.
//! When a record shows that a crawl moved on to a new visit, the previous visit
//! is finalized (backend flush, then a completion signal) before the new
//! record is persisted. The visit map is touched only from the ingestion loop.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::{
  control::{ListenerEnd, ShutdownPoll, StatusSample, bridge},
  domain::{
    config::ListenerSettings,
    record::{ContentRecord, CrawlId, Fields, IncomingRecord, Record, VisitId, record_keys},
  },
  storage::{BackendError, ListenerBackend},
  transport::{self, Pop, RecordSink, RecordSource, Transport, TransportError},
};

#[derive(Debug, Error)]
pub enum ListenerError {
  #[error("Transport error: {0}")]
  Transport(#[from] TransportError),
  #[error("Backend error: {0}")]
  Backend(#[from] BackendError),
  #[error("Listener is {actual:?}, expected {expected:?}")]
  InvalidState {
    expected: ListenerState,
    actual: ListenerState,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
  Init,
  Running,
  Draining,
  Terminated,
}

pub struct Listener<B> {
  channels: ListenerEnd,
  backend: B,
  settings: ListenerSettings,
  state: ListenerState,
  /// crawl_id → visit currently being produced
  visits: HashMap<CrawlId, VisitId>,
  /// Handed to the transport on startup
  sink: Option<RecordSink>,
  source: RecordSource,
  transport: Option<Transport>,
  last_status: Instant,
}

impl<B: ListenerBackend> Listener<B> {
  pub fn new(channels: ListenerEnd, backend: B, settings: ListenerSettings) -> Self {
    let (sink, source) = transport::queue();
    Self {
      channels,
      backend,
      settings,
      state: ListenerState::Init,
      visits: HashMap::new(),
      sink: Some(sink),
      source,
      transport: None,
      last_status: Instant::now(),
    }
  }

  pub fn state(&self) -> ListenerState {
    self.state
  }

  /// The visit each crawl is currently producing.
  pub fn open_visits(&self) -> &HashMap<CrawlId, VisitId> {
    &self.visits
  }

  pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
    self.transport.as_ref().map(Transport::local_addr)
  }

  /// An extra producer handle for in-process delivery.
  ///
  /// Only available before `startup`. Holders must drop it before shutdown,
  /// otherwise the drain cannot tell that no more records will arrive.
  pub fn record_sink(&self) -> Option<RecordSink> {
    self.sink.clone()
  }

  /// Run the full lifecycle until a shutdown request has been handled.
  pub async fn run(&mut self) -> Result<(), ListenerError> {
    self.startup().await?;

    let poll_interval = self.settings.record_poll_interval();
    loop {
      if self.should_shutdown() {
        break;
      }
      self.update_status_queue();

      match tokio::time::timeout(poll_interval, self.source.recv()).await {
        Ok(Some(record)) => self.handle(record).await?,
        Ok(None) => {
          warn!("Record source closed while running");
          break;
        }
        Err(_) => {}
      }
    }

    self.drain_queue().await?;
    self.shutdown().await
  }

  /// Bind the transport and publish its address on the status channel.
  pub async fn startup(&mut self) -> Result<(), ListenerError> {
    self.expect_state(ListenerState::Init)?;

    let sink = self.sink.take().ok_or(ListenerError::InvalidState {
      expected: ListenerState::Init,
      actual: self.state,
    })?;
    let transport = Transport::bind(self.settings.bind_addr, sink, self.settings.drain_timeout()).await?;
    let addr = transport.local_addr();
    self.transport = Some(transport);

    if let Err(e) = self.channels.publish_status(StatusSample::Rendezvous(addr)) {
      warn!(error = %e, "Could not publish listener address");
    }

    self.state = ListenerState::Running;
    info!(%addr, "Listener started");
    Ok(())
  }

  /// Dispatch one incoming frame to the matching handler.
  pub async fn handle(&mut self, record: IncomingRecord) -> Result<(), ListenerError> {
    match record {
      IncomingRecord::Record(record) => self.process_record(record).await,
      IncomingRecord::Content(record) => self.process_content(record).await,
    }
  }

  /// Attribute a structured record to its visit, then persist it.
  ///
  /// Records missing an identifier are dropped here and never reach the backend.
  pub async fn process_record(&mut self, record: Record) -> Result<(), ListenerError> {
    if self.update_records(&record.table, &record.data).await? {
      self.backend.process_record(record).await?;
    }
    Ok(())
  }

  pub async fn process_content(&mut self, record: ContentRecord) -> Result<(), ListenerError> {
    trace!(table = %record.table, hash = %record.content_hash, "Content record");
    self.backend.process_content(record).await?;
    Ok(())
  }

  /// Track which visit each crawl is producing.
  ///
  /// Returns `false` (after logging) when the record cannot be attributed. When
  /// the crawl has moved on to a new visit, the previous one is finalized
  /// before the mapping changes.
  pub async fn update_records(&mut self, table: &str, data: &Fields) -> Result<bool, ListenerError> {
    let (crawl_id, visit_id) = match record_keys(data) {
      Ok(keys) => keys,
      Err(missing) => {
        error!(table = %table, "Record for table {} has no {}", table, missing);
        error!("{}", serde_json::Value::Object(data.clone()));
        return Ok(false);
      }
    };

    match self.visits.get(&crawl_id).copied() {
      None => {
        debug!(%crawl_id, %visit_id, "New crawl");
        self.visits.insert(crawl_id, visit_id);
      }
      Some(previous) if previous != visit_id => {
        debug!(%crawl_id, %previous, %visit_id, "Crawl moved to a new visit");
        self.finalize_visit(previous, false).await?;
        self.visits.insert(crawl_id, visit_id);
      }
      Some(_) => {}
    }

    Ok(true)
  }

  /// Publish `visit_id` on the completion channel. Does not deduplicate.
  pub fn mark_visit_id_done(&self, visit_id: VisitId) {
    debug!(%visit_id, "Putting visit into completion queue");
    if let Err(e) = self.channels.publish_completion(visit_id) {
      warn!(%visit_id, error = %e, "Could not publish completion");
    }
  }

  /// Flush the visit in the backend, then announce it as saved.
  async fn finalize_visit(&mut self, visit_id: VisitId, is_shutdown: bool) -> Result<(), ListenerError> {
    self.backend.visit_done(visit_id, is_shutdown).await?;
    self.mark_visit_id_done(visit_id);
    Ok(())
  }

  /// Publish the queue depth, at most once per status update interval.
  pub fn update_status_queue(&mut self) {
    if self.last_status.elapsed() < self.settings.status_update_interval() {
      return;
    }

    let depth = self.source.len();
    if let Err(e) = self.channels.publish_status(StatusSample::Sample(depth)) {
      warn!(error = %e, "Could not publish status");
    }
    debug!(
      depth,
      open_visits = self.visits.len(),
      "Status update; current record queue size: {}",
      depth
    );
    self.last_status = Instant::now();
  }

  /// Non-blocking check for a shutdown request. Consumes the sentinel.
  ///
  /// A vanished aggregator counts as a request: nobody is left to ask.
  pub fn should_shutdown(&mut self) -> bool {
    match self.channels.poll_shutdown() {
      ShutdownPoll::Requested => {
        info!("Received shutdown signal!");
        true
      }
      ShutdownPoll::Disconnected => {
        warn!("Aggregator is gone, shutting down");
        true
      }
      ShutdownPoll::Idle => false,
    }
  }

  /// Close the transport, then process every record still queued.
  ///
  /// `Transport::close` returns only after every connection has reached EOF or
  /// been cut off, so nothing the transport accepted can land after the queue
  /// reads empty.
  pub async fn drain_queue(&mut self) -> Result<(), ListenerError> {
    self.state = ListenerState::Draining;
    if let Some(transport) = self.transport.as_mut() {
      transport.close().await;
    }

    let mut drained = 0usize;
    loop {
      match self.source.try_pop() {
        Pop::Record(record) => {
          self.handle(record).await?;
          drained += 1;
        }
        Pop::Closed => break,
        Pop::Empty => {
          warn!("Record producers outside the transport are still alive; later records will be ignored");
          break;
        }
      }
    }

    info!(drained, "Record queue drained");
    Ok(())
  }

  /// Close the transport and finalize every visit still open.
  pub async fn shutdown(&mut self) -> Result<(), ListenerError> {
    if let Some(transport) = self.transport.as_mut() {
      transport.close().await;
    }

    let open: BTreeSet<VisitId> = self.visits.drain().map(|(_, visit_id)| visit_id).collect();
    info!(open_visits = open.len(), "Finalizing open visits");
    for visit_id in open {
      self.finalize_visit(visit_id, true).await?;
    }

    self.backend.close().await?;
    self.state = ListenerState::Terminated;
    info!("Listener shutdown complete");
    Ok(())
  }

  fn expect_state(&self, expected: ListenerState) -> Result<(), ListenerError> {
    if self.state == expected {
      Ok(())
    } else {
      Err(ListenerError::InvalidState {
        expected,
        actual: self.state,
      })
    }
  }
}

/// Entry point of the listener process: run until shutdown completes.
pub async fn listener_entry<B: ListenerBackend>(
  channels: ListenerEnd,
  backend: B,
  settings: ListenerSettings,
) -> Result<(), ListenerError> {
  let mut listener = Listener::new(channels, backend, settings);
  let result = listener.run().await;
  if let Err(ref e) = result {
    error!(error = %e, "Listener failed");
  }
  result
}

/// Run [`listener_entry`] with the control channels on stdin/stdout.
///
/// Used by the child process a [`ProcessLauncher`](crate::ProcessLauncher)
/// spawns. Returns after every control frame has been written.
pub async fn run_stdio_listener<B: ListenerBackend>(backend: B, settings: ListenerSettings) -> Result<(), ListenerError> {
  let (channels, bridge) = bridge::stdio_listener_end();
  let result = listener_entry(channels, backend, settings).await;
  if let Err(e) = bridge.finish().await {
    warn!(error = %e, "Failed to flush control frames");
  }
  result
}
