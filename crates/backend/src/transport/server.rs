use std::{net::SocketAddr, time::Duration};

use futures::{FutureExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
  codec::{FramedRead, LinesCodec, LinesCodecError},
  sync::CancellationToken,
  task::TaskTracker,
};
use tracing::{debug, error, info, trace, warn};

use super::{MAX_FRAME_BYTES, RecordSink, TransportError};
use crate::domain::record::IncomingRecord;

/// TCP listener that feeds worker frames into a [`RecordSink`].
///
/// The accept loop and every connection task hold a clone of the sink. Once
/// [`Transport::close`] returns all of those tasks have exited, so the only
/// sinks left alive are ones the caller kept. That is the handshake the
/// listener relies on before draining its queue.
///
/// Closing happens in two steps: the accept loop stops, then every open
/// connection keeps reading until its worker closes the socket. Connections
/// still open after `drain_timeout` are cut off.
pub struct Transport {
  local_addr: SocketAddr,
  drain_timeout: Duration,
  stop_accepting: CancellationToken,
  cut_off: CancellationToken,
  tracker: TaskTracker,
  closed: bool,
}

impl Transport {
  /// Bind to `addr` and start accepting connections.
  pub async fn bind(addr: SocketAddr, sink: RecordSink, drain_timeout: Duration) -> Result<Self, TransportError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let stop_accepting = CancellationToken::new();
    let cut_off = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(accept_loop(
      listener,
      sink,
      stop_accepting.clone(),
      cut_off.clone(),
      tracker.clone(),
    ));

    info!(%local_addr, "Record transport listening");

    Ok(Self {
      local_addr,
      drain_timeout,
      stop_accepting,
      cut_off,
      tracker,
      closed: false,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }

  /// Stop accepting, let open connections read to EOF, and wait for every
  /// task to exit.
  ///
  /// Idempotent. Connections still open after the drain timeout are cut off
  /// and whatever they had not yet read is lost.
  pub async fn close(&mut self) {
    if self.closed {
      return;
    }

    self.stop_accepting.cancel();
    self.tracker.close();

    if tokio::time::timeout(self.drain_timeout, self.tracker.wait()).await.is_err() {
      warn!(
        open = self.tracker.len(),
        timeout = ?self.drain_timeout,
        "Worker connections still open after drain timeout, cutting them off"
      );
      self.cut_off.cancel();
      self.tracker.wait().await;
    }
    self.closed = true;

    debug!(local_addr = %self.local_addr, "Record transport closed");
  }
}

impl Drop for Transport {
  fn drop(&mut self) {
    self.stop_accepting.cancel();
    self.cut_off.cancel();
  }
}

async fn accept_loop(
  listener: TcpListener,
  sink: RecordSink,
  stop_accepting: CancellationToken,
  cut_off: CancellationToken,
  tracker: TaskTracker,
) {
  loop {
    tokio::select! {
      biased;

      _ = stop_accepting.cancelled() => break,

      result = listener.accept() => {
        match result {
          Ok((stream, peer)) => {
            trace!(%peer, "Worker connected");
            tracker.spawn(handle_connection(stream, peer, sink.clone(), cut_off.clone()));
          }
          Err(e) => {
            error!("Accept error: {}", e);
          }
        }
      }
    }
  }

  // Connections the kernel already completed still get their records read.
  while let Some(Ok((stream, peer))) = listener.accept().now_or_never() {
    trace!(%peer, "Worker connected during shutdown");
    tracker.spawn(handle_connection(stream, peer, sink.clone(), cut_off.clone()));
  }
  debug!("Accept loop stopped");
}

/// Read frames from one worker until it closes its socket or the transport
/// cuts the connection off.
///
/// Invalid frames are logged and skipped; they never end the connection.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, sink: RecordSink, cut_off: CancellationToken) {
  let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
  let mut received = 0u64;

  loop {
    let line = tokio::select! {
      biased;

      _ = cut_off.cancelled() => {
        warn!(%peer, records = received, "Connection cut off before the worker closed it");
        break;
      }

      next = lines.next() => match next {
        Some(Ok(line)) => line,
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
          warn!(%peer, max = MAX_FRAME_BYTES, "Dropping oversized frame");
          continue;
        }
        Some(Err(e)) => {
          warn!(%peer, error = %e, "Error reading from worker");
          break;
        }
        None => break,
      },
    };

    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let record: IncomingRecord = match serde_json::from_str(trimmed) {
      Ok(r) => r,
      Err(e) => {
        warn!(%peer, "Invalid record frame: {}", e);
        continue;
      }
    };

    if sink.push(record).is_err() {
      warn!(%peer, "Record source is gone, closing connection");
      break;
    }
    received += 1;
  }

  debug!(%peer, records = received, "Worker disconnected");
}
