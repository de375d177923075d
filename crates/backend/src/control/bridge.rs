//! Carries the control channels across a process boundary.
//!
//! The listener process writes status and completion frames to its stdout and
//! reads the shutdown frame from its stdin. Each side runs two small forwarding
//! tasks that translate between newline-delimited JSON [`ControlFrame`]s and the
//! in-process queues of [`super::pair`].
//!
//! ```text
//! manager process                              listener process
//! ManagerEnd <─ inbound ── child stdout ─── outbound <─ ListenerEnd
//! ManagerEnd ── outbound ─> child stdin ─── inbound ──> ListenerEnd
//! ```

use futures::{SinkExt, StreamExt};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::mpsc::{UnboundedReceiver, UnboundedSender},
  task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use super::{ControlError, ControlFrame, ListenerEnd, ManagerEnd, ShutdownSignal, StatusSample};
use crate::domain::record::VisitId;

/// The forwarding tasks of one side of a bridge.
#[derive(Debug)]
pub struct BridgeHandle {
  inbound: JoinHandle<Result<(), ControlError>>,
  outbound: JoinHandle<Result<(), ControlError>>,
}

impl BridgeHandle {
  /// Wait until every outbound frame has been written, then stop reading.
  ///
  /// The outbound task ends once all local senders are dropped, so the caller
  /// must drop its channel end first.
  pub async fn finish(self) -> Result<(), ControlError> {
    let result = match self.outbound.await {
      Ok(result) => result,
      Err(e) => {
        warn!(error = %e, "Control bridge writer task failed");
        Ok(())
      }
    };
    self.inbound.abort();
    result
  }

  /// Wait until the peer closes its stream and every frame it wrote has been
  /// delivered locally, then stop writing.
  ///
  /// Used by the manager once the listener process has exited: completions
  /// still buffered in the pipe are not lost.
  pub async fn wait_closed(self) -> Result<(), ControlError> {
    let result = match self.inbound.await {
      Ok(result) => result,
      Err(e) => {
        warn!(error = %e, "Control bridge reader task failed");
        Ok(())
      }
    };
    self.outbound.abort();
    result
  }

  /// Stop both forwarding tasks immediately.
  pub fn abort(&self) {
    self.inbound.abort();
    self.outbound.abort();
  }
}

/// Manager side: `reader` is the listener's stdout, `writer` its stdin.
pub fn connect_manager<R, W>(reader: R, writer: W) -> (ManagerEnd, BridgeHandle)
where
  R: AsyncRead + Unpin + Send + 'static,
  W: AsyncWrite + Unpin + Send + 'static,
{
  let (manager, listener) = super::pair();
  let ListenerEnd {
    status,
    completion,
    shutdown,
  } = listener;

  let inbound = tokio::spawn(forward_to_manager(reader, status, completion));
  let outbound = tokio::spawn(forward_shutdown(writer, shutdown));

  (manager, BridgeHandle { inbound, outbound })
}

/// Listener side: `reader` carries the manager's frames, `writer` receives ours.
pub fn connect_listener<R, W>(reader: R, writer: W) -> (ListenerEnd, BridgeHandle)
where
  R: AsyncRead + Unpin + Send + 'static,
  W: AsyncWrite + Unpin + Send + 'static,
{
  let (manager, listener) = super::pair();
  let ManagerEnd {
    status,
    completion,
    shutdown,
  } = manager;

  let inbound = tokio::spawn(forward_to_listener(reader, shutdown));
  let outbound = tokio::spawn(forward_reports(writer, status, completion));

  (listener, BridgeHandle { inbound, outbound })
}

/// Listener side over this process's stdin/stdout.
///
/// Stdout is reserved for control frames once this is called; logs must go
/// elsewhere.
pub fn stdio_listener_end() -> (ListenerEnd, BridgeHandle) {
  connect_listener(tokio::io::stdin(), tokio::io::stdout())
}

async fn forward_to_manager<R>(
  reader: R,
  status: UnboundedSender<StatusSample>,
  completion: UnboundedSender<VisitId>,
) -> Result<(), ControlError>
where
  R: AsyncRead + Unpin,
{
  let mut lines = FramedRead::new(reader, LinesCodec::new());

  while let Some(line) = lines.next().await {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }

    // Send failures mean the aggregator dropped its end; keep reading so the
    // listener never blocks on a full pipe.
    match serde_json::from_str::<ControlFrame>(&line) {
      Ok(ControlFrame::Status { sample }) => {
        let _ = status.send(sample);
      }
      Ok(ControlFrame::Completion { visit_id }) => {
        let _ = completion.send(visit_id);
      }
      Ok(ControlFrame::Shutdown { .. }) => {
        warn!("Listener sent a shutdown frame, ignoring");
      }
      Err(e) => {
        warn!(error = %e, line = %line, "Invalid control frame from listener");
      }
    }
  }

  debug!("Listener closed its control stream");
  Ok(())
}

async fn forward_shutdown<W>(writer: W, mut shutdown: UnboundedReceiver<ShutdownSignal>) -> Result<(), ControlError>
where
  W: AsyncWrite + Unpin,
{
  let mut sink = FramedWrite::new(writer, LinesCodec::new());

  // At most one sentinel is ever sent; the writer is dropped right after so
  // the listener's stdin reaches EOF.
  if let Some(signal) = shutdown.recv().await {
    let json = serde_json::to_string(&ControlFrame::Shutdown { signal })?;
    sink.send(json).await?;
  }

  Ok(())
}

async fn forward_to_listener<R>(reader: R, shutdown: UnboundedSender<ShutdownSignal>) -> Result<(), ControlError>
where
  R: AsyncRead + Unpin,
{
  let mut lines = FramedRead::new(reader, LinesCodec::new());

  while let Some(line) = lines.next().await {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }

    match serde_json::from_str::<ControlFrame>(&line) {
      Ok(ControlFrame::Shutdown { signal }) => {
        let _ = shutdown.send(signal);
      }
      Ok(frame) => {
        warn!(?frame, "Unexpected control frame from aggregator");
      }
      Err(e) => {
        warn!(error = %e, "Invalid control frame from aggregator");
      }
    }
  }

  debug!("Aggregator closed its control stream");
  Ok(())
}

async fn forward_reports<W>(
  writer: W,
  mut status: UnboundedReceiver<StatusSample>,
  mut completion: UnboundedReceiver<VisitId>,
) -> Result<(), ControlError>
where
  W: AsyncWrite + Unpin,
{
  let mut sink = FramedWrite::new(writer, LinesCodec::new());

  loop {
    let frame = tokio::select! {
      Some(sample) = status.recv() => ControlFrame::Status { sample },
      Some(visit_id) = completion.recv() => ControlFrame::Completion { visit_id },
      else => break,
    };

    sink.send(serde_json::to_string(&frame)?).await?;
  }

  Ok(())
}
