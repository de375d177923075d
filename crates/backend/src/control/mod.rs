//! Control channels between the aggregator and its listener.
//!
//! Three independent FIFO channels connect the two sides:
//!
//! ```text
//! Aggregator (ManagerEnd)                 Listener (ListenerEnd)
//!   status      <──── Rendezvous(addr), Sample(depth), ...
//!   completion  <──── visit_id, visit_id, ...
//!   shutdown    ────> SHUTDOWN (at most once)
//! ```
//!
//! Each channel is strictly FIFO; nothing is guaranteed across channels.
//! In-process both ends are tokio unbounded queues. Across a process boundary
//! the [`bridge`] module multiplexes them over the child's stdio as
//! newline-delimited [`ControlFrame`]s and feeds them back into the same queue
//! types, so callers never see the difference.

pub mod bridge;

use std::{fmt, net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::domain::record::VisitId;

/// Wire value of the shutdown sentinel.
pub const SHUTDOWN_SIGNAL: &str = "SHUTDOWN";

/// Names one of the three control channels (for errors and logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
  Status,
  Completion,
  Shutdown,
}

impl fmt::Display for Channel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Channel::Status => f.write_str("status"),
      Channel::Completion => f.write_str("completion"),
      Channel::Shutdown => f.write_str("shutdown"),
    }
  }
}

#[derive(Debug, Error)]
pub enum ControlError {
  #[error("{0} channel closed")]
  Closed(Channel),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Framing error: {0}")]
  Codec(#[from] tokio_util::codec::LinesCodecError),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// A value on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSample {
  /// Address of the listener's record transport, sent once after startup
  Rendezvous(SocketAddr),
  /// Number of records waiting in the listener's queue
  Sample(usize),
}

/// The shutdown sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
  #[serde(rename = "SHUTDOWN")]
  Shutdown,
}

/// One message on the multiplexed stdio wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum ControlFrame {
  Status { sample: StatusSample },
  Completion { visit_id: VisitId },
  Shutdown { signal: ShutdownSignal },
}

/// Result of a non-blocking check of the shutdown channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPoll {
  /// The sentinel was received (and consumed)
  Requested,
  /// Nothing pending
  Idle,
  /// The aggregator side is gone and can never send
  Disconnected,
}

/// Create a connected pair of channel ends.
pub fn pair() -> (ManagerEnd, ListenerEnd) {
  let (status_tx, status_rx) = mpsc::unbounded_channel();
  let (completion_tx, completion_rx) = mpsc::unbounded_channel();
  let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

  let manager = ManagerEnd {
    status: status_rx,
    completion: completion_rx,
    shutdown: shutdown_tx,
  };
  let listener = ListenerEnd {
    status: status_tx,
    completion: completion_tx,
    shutdown: shutdown_rx,
  };
  (manager, listener)
}

// ============================================================================
// Manager End
// ============================================================================

/// The aggregator's side: receives status and completions, sends shutdown.
#[derive(Debug)]
pub struct ManagerEnd {
  status: UnboundedReceiver<StatusSample>,
  completion: UnboundedReceiver<VisitId>,
  shutdown: UnboundedSender<ShutdownSignal>,
}

impl ManagerEnd {
  /// Wait up to `timeout` for the next status value.
  ///
  /// Returns `Ok(None)` on timeout.
  pub async fn recv_status_timeout(&mut self, timeout: Duration) -> Result<Option<StatusSample>, ControlError> {
    match tokio::time::timeout(timeout, self.status.recv()).await {
      Ok(Some(sample)) => Ok(Some(sample)),
      Ok(None) => Err(ControlError::Closed(Channel::Status)),
      Err(_) => Ok(None),
    }
  }

  /// Take the next queued status value without waiting.
  pub fn try_status(&mut self) -> Result<Option<StatusSample>, ControlError> {
    match self.status.try_recv() {
      Ok(sample) => Ok(Some(sample)),
      Err(TryRecvError::Empty) => Ok(None),
      Err(TryRecvError::Disconnected) => Err(ControlError::Closed(Channel::Status)),
    }
  }

  /// Take every queued completion, in order.
  pub fn drain_completions(&mut self) -> Vec<VisitId> {
    let mut visit_ids = Vec::new();
    while let Ok(visit_id) = self.completion.try_recv() {
      visit_ids.push(visit_id);
    }
    visit_ids
  }

  pub fn send_shutdown(&self) -> Result<(), ControlError> {
    self
      .shutdown
      .send(ShutdownSignal::Shutdown)
      .map_err(|_| ControlError::Closed(Channel::Shutdown))
  }
}

// ============================================================================
// Listener End
// ============================================================================

/// The listener's side: publishes status and completions, watches shutdown.
#[derive(Debug)]
pub struct ListenerEnd {
  status: UnboundedSender<StatusSample>,
  completion: UnboundedSender<VisitId>,
  shutdown: UnboundedReceiver<ShutdownSignal>,
}

impl ListenerEnd {
  pub fn publish_status(&self, sample: StatusSample) -> Result<(), ControlError> {
    self.status.send(sample).map_err(|_| ControlError::Closed(Channel::Status))
  }

  pub fn publish_completion(&self, visit_id: VisitId) -> Result<(), ControlError> {
    self
      .completion
      .send(visit_id)
      .map_err(|_| ControlError::Closed(Channel::Completion))
  }

  pub fn poll_shutdown(&mut self) -> ShutdownPoll {
    match self.shutdown.try_recv() {
      Ok(ShutdownSignal::Shutdown) => ShutdownPoll::Requested,
      Err(TryRecvError::Empty) => ShutdownPoll::Idle,
      Err(TryRecvError::Disconnected) => ShutdownPoll::Disconnected,
    }
  }
}
