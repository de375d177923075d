//! Record delivery from crawl workers into the listener.
//!
//! Workers connect to the listener's [`Transport`] over TCP and send
//! newline-delimited JSON [`IncomingRecord`] frames. Every connection pushes
//! into one shared [`RecordSink`]; the listener's ingestion loop is the only
//! consumer of the matching [`RecordSource`].
//!
//! ```text
//! RecordClient ─┐
//! RecordClient ─┼─> Transport (one task per connection) ─> RecordSink ─> RecordSource ─> Listener
//! RecordClient ─┘
//! ```

mod client;
mod server;

use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

pub use client::RecordClient;
pub use server::Transport;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::domain::record::IncomingRecord;

/// Longest accepted frame; content blobs travel hex-encoded in a single line.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Framing error: {0}")]
  Codec(#[from] tokio_util::codec::LinesCodecError),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("Record source has been dropped")]
  SourceClosed,
}

/// Create the record queue.
pub fn queue() -> (RecordSink, RecordSource) {
  let (tx, rx) = mpsc::unbounded_channel();
  let depth = Arc::new(AtomicUsize::new(0));
  (
    RecordSink {
      tx,
      depth: Arc::clone(&depth),
    },
    RecordSource { rx, depth },
  )
}

/// Producer handle. Cheap to clone; one per delivering task.
#[derive(Debug, Clone)]
pub struct RecordSink {
  tx: UnboundedSender<IncomingRecord>,
  depth: Arc<AtomicUsize>,
}

impl RecordSink {
  pub fn push(&self, record: IncomingRecord) -> Result<(), TransportError> {
    // Count first so the consumer never decrements below zero.
    self.depth.fetch_add(1, Ordering::Relaxed);
    self.tx.send(record).map_err(|_| {
      self.depth.fetch_sub(1, Ordering::Relaxed);
      TransportError::SourceClosed
    })
  }
}

/// Outcome of a non-blocking pop.
#[derive(Debug)]
pub enum Pop {
  Record(IncomingRecord),
  /// Nothing queued right now, but producers are still alive
  Empty,
  /// Nothing queued and every producer is gone
  Closed,
}

/// The listener's end of the record queue.
#[derive(Debug)]
pub struct RecordSource {
  rx: UnboundedReceiver<IncomingRecord>,
  depth: Arc<AtomicUsize>,
}

impl RecordSource {
  /// Wait for the next record. `None` once every sink is dropped and the
  /// queue is empty.
  pub async fn recv(&mut self) -> Option<IncomingRecord> {
    let record = self.rx.recv().await?;
    self.depth.fetch_sub(1, Ordering::Relaxed);
    Some(record)
  }

  pub fn try_pop(&mut self) -> Pop {
    match self.rx.try_recv() {
      Ok(record) => {
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Pop::Record(record)
      }
      Err(TryRecvError::Empty) => Pop::Empty,
      Err(TryRecvError::Disconnected) => Pop::Closed,
    }
  }

  /// Number of records waiting.
  pub fn len(&self) -> usize {
    self.depth.load(Ordering::Relaxed)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
