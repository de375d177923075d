//! The manager-side handle on a listener.
//!
//! # Lifecycle
//!
//! ```text
//! Unstarted ──launch──> Launched ──shutdown──> ShuttingDown ──> Stopped
//! ```
//!
//! `launch` starts the listener through a [`Launcher`] and waits for the
//! rendezvous address. While launched, the aggregator reads queue-depth samples
//! and finalized visit ids off the control channels. `shutdown` sends the
//! sentinel and joins the listener within a deadline, killing it if the
//! deadline passes.
//!
//! The completion channel outlives shutdown, so visits finalized during the
//! listener's own shutdown can still be collected with
//! [`Aggregator::get_saved_visit_ids`].

use std::{io, net::SocketAddr, path::PathBuf, process::Stdio, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use thiserror::Error;
use tokio::{process::Command, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
  control::{ControlError, ListenerEnd, ManagerEnd, StatusSample, bridge},
  domain::{
    config::{AggregatorSettings, ListenerSettings},
    record::{CrawlId, VisitId},
  },
  listener::{ListenerError, listener_entry},
  storage::{AggregatorBackend, BackendError, CrawlConfiguration, ListenerBackend},
};

#[derive(Debug, Error)]
pub enum AggregatorError {
  #[error("Listener has not reported status for {elapsed:?}")]
  ListenerUnresponsive { elapsed: Duration },
  #[error("Listener exited")]
  ListenerExited,
  #[error("Protocol error: {0}")]
  Protocol(String),
  #[error("Failed to spawn listener: {0}")]
  Spawn(#[source] io::Error),
  #[error("Listener has not been launched")]
  NotLaunched,
  #[error("Listener has already been launched")]
  AlreadyLaunched,
  #[error("Control channel error: {0}")]
  Control(ControlError),
  #[error("Backend error: {0}")]
  Backend(#[from] BackendError),
}

impl From<ControlError> for AggregatorError {
  fn from(e: ControlError) -> Self {
    match e {
      ControlError::Closed(_) => AggregatorError::ListenerExited,
      other => AggregatorError::Control(other),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
  Unstarted,
  Launched,
  ShuttingDown,
  Stopped,
}

/// How the listener ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
  /// The listener terminated on its own within the deadline
  Stopped { elapsed: Duration },
  /// The listener ended within the deadline but reported a failure: an error,
  /// a panic, or a non-zero or signalled exit status
  Failed { elapsed: Duration, reason: String },
  /// The deadline passed; `killed` tells whether termination was forced
  TimedOut { waited: Duration, killed: bool },
}

impl ShutdownOutcome {
  pub fn is_clean(&self) -> bool {
    matches!(self, ShutdownOutcome::Stopped { .. })
  }
}

// ============================================================================
// Launchers
// ============================================================================

/// Starts a listener wired to the given channel end.
pub trait Launcher {
  fn launch(self) -> Result<(ManagerEnd, ListenerProcess), AggregatorError>;
}

type ListenerFuture = BoxFuture<'static, Result<(), ListenerError>>;

/// Runs the listener as a tokio task in this process.
pub struct TaskLauncher {
  entry: Box<dyn FnOnce(ListenerEnd) -> ListenerFuture + Send>,
}

impl TaskLauncher {
  /// Run an arbitrary entry function in place of the listener.
  pub fn new<F, Fut>(entry: F) -> Self
  where
    F: FnOnce(ListenerEnd) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
  {
    Self {
      entry: Box::new(move |channels| entry(channels).boxed()),
    }
  }

  /// Run a real [`Listener`](crate::Listener) over `backend`.
  pub fn listener<B>(backend: B, settings: ListenerSettings) -> Self
  where
    B: ListenerBackend + 'static,
  {
    Self::new(move |channels| listener_entry(channels, backend, settings))
  }
}

impl Launcher for TaskLauncher {
  fn launch(self) -> Result<(ManagerEnd, ListenerProcess), AggregatorError> {
    let (manager, listener) = crate::control::pair();
    let handle = tokio::spawn((self.entry)(listener));
    Ok((manager, ListenerProcess::Task(handle)))
  }
}

/// Runs the listener as a child process, control channels over its stdio.
pub struct ProcessLauncher {
  command: Command,
}

impl ProcessLauncher {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      command: Command::new(program.into()),
    }
  }

  /// Re-execute the running binary.
  pub fn current_exe() -> io::Result<Self> {
    Ok(Self::new(std::env::current_exe()?))
  }

  pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
    self.command.arg(arg);
    self
  }

  pub fn env(mut self, key: impl AsRef<std::ffi::OsStr>, value: impl AsRef<std::ffi::OsStr>) -> Self {
    self.command.env(key, value);
    self
  }
}

impl Launcher for ProcessLauncher {
  fn launch(mut self) -> Result<(ManagerEnd, ListenerProcess), AggregatorError> {
    self
      .command
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true);

    // A terminal ctrl-c reaches the whole foreground process group. The
    // listener stops only when the aggregator says so.
    #[cfg(unix)]
    self.command.process_group(0);

    let mut child = self.command.spawn().map_err(AggregatorError::Spawn)?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
      return Err(AggregatorError::Protocol("listener stdio was not captured".into()));
    };

    debug!(pid = ?child.id(), "Spawned listener process");
    let (manager, bridge) = bridge::connect_manager(stdout, stdin);
    Ok((manager, ListenerProcess::Child { child, bridge }))
  }
}

/// A running listener, however it was started.
pub enum ListenerProcess {
  Task(JoinHandle<Result<(), ListenerError>>),
  Child {
    child: tokio::process::Child,
    bridge: bridge::BridgeHandle,
  },
}

enum Exit {
  Exited,
  Failed(String),
  TimedOut { killed: bool },
}

impl ListenerProcess {
  /// Wait up to `deadline` for the listener to end; force it down otherwise.
  async fn join(self, deadline: Duration) -> Exit {
    let started = Instant::now();

    match self {
      ListenerProcess::Task(mut handle) => match tokio::time::timeout(deadline, &mut handle).await {
        Ok(Ok(Ok(()))) => Exit::Exited,
        Ok(Ok(Err(e))) => {
          error!(error = %e, "Listener ended with an error");
          Exit::Failed(e.to_string())
        }
        Ok(Err(e)) => {
          error!(error = %e, "Listener task failed");
          Exit::Failed(e.to_string())
        }
        Err(_) => {
          handle.abort();
          Exit::TimedOut { killed: true }
        }
      },
      ListenerProcess::Child { mut child, bridge } => match tokio::time::timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => {
          let remaining = deadline.saturating_sub(started.elapsed());
          match tokio::time::timeout(remaining, bridge.wait_closed()).await {
            Ok(Err(e)) => warn!(error = %e, "Control stream ended with an error"),
            Err(_) => warn!("Control stream still open after listener exit"),
            Ok(Ok(())) => {}
          }

          if status.success() {
            debug!(%status, "Listener process exited");
            Exit::Exited
          } else {
            error!(%status, "Listener process exited unsuccessfully");
            Exit::Failed(format!("listener process {}", status))
          }
        }
        Ok(Err(e)) => {
          error!(error = %e, "Failed to wait for listener process");
          bridge.abort();
          Exit::Failed(format!("failed to wait for listener process: {}", e))
        }
        Err(_) => {
          let killed = match child.kill().await {
            Ok(()) => true,
            Err(e) => {
              error!(error = %e, "Failed to kill listener process");
              false
            }
          };
          bridge.abort();
          Exit::TimedOut { killed }
        }
      },
    }
  }

  async fn kill(self) {
    match self {
      ListenerProcess::Task(handle) => handle.abort(),
      ListenerProcess::Child { mut child, bridge } => {
        if let Err(e) = child.kill().await {
          warn!(error = %e, "Failed to kill listener process");
        }
        bridge.abort();
      }
    }
  }
}

// ============================================================================
// Aggregator
// ============================================================================

pub struct Aggregator<B> {
  backend: B,
  settings: AggregatorSettings,
  state: AggregatorState,
  channels: Option<ManagerEnd>,
  process: Option<ListenerProcess>,
  listener_address: Option<SocketAddr>,
  /// Most recent queue depth and when it arrived
  last_status: Option<(usize, Instant)>,
}

impl<B: AggregatorBackend> Aggregator<B> {
  pub fn new(backend: B, settings: AggregatorSettings) -> Self {
    Self {
      backend,
      settings,
      state: AggregatorState::Unstarted,
      channels: None,
      process: None,
      listener_address: None,
      last_status: None,
    }
  }

  pub fn state(&self) -> AggregatorState {
    self.state
  }

  /// Where workers should send records. `None` unless launched.
  pub fn listener_address(&self) -> Option<SocketAddr> {
    self.listener_address
  }

  pub async fn save_configuration(&self, configuration: &CrawlConfiguration) -> Result<(), AggregatorError> {
    self.backend.save_configuration(configuration).await?;
    Ok(())
  }

  pub async fn get_next_visit_id(&self) -> Result<VisitId, AggregatorError> {
    Ok(self.backend.next_visit_id().await?)
  }

  pub async fn get_next_crawl_id(&self) -> Result<CrawlId, AggregatorError> {
    Ok(self.backend.next_crawl_id().await?)
  }

  /// Start the listener and wait for its rendezvous address.
  pub async fn launch<L: Launcher>(&mut self, launcher: L) -> Result<SocketAddr, AggregatorError> {
    if self.state != AggregatorState::Unstarted {
      return Err(AggregatorError::AlreadyLaunched);
    }

    let (mut channels, process) = launcher.launch()?;
    let timeout = self.settings.status_timeout();

    let addr = match channels.recv_status_timeout(timeout).await {
      Ok(Some(StatusSample::Rendezvous(addr))) => addr,
      Ok(Some(StatusSample::Sample(depth))) => {
        process.kill().await;
        return Err(AggregatorError::Protocol(format!(
          "expected the listener address, got queue depth {}",
          depth
        )));
      }
      Ok(None) => {
        process.kill().await;
        return Err(AggregatorError::ListenerUnresponsive { elapsed: timeout });
      }
      Err(e) => {
        process.kill().await;
        return Err(e.into());
      }
    };

    self.channels = Some(channels);
    self.process = Some(process);
    self.listener_address = Some(addr);
    self.state = AggregatorState::Launched;
    info!(%addr, "Listener launched");
    Ok(addr)
  }

  /// Wait for the next queue-depth sample, up to the status timeout.
  pub async fn get_status(&mut self) -> Result<usize, AggregatorError> {
    let timeout = self.settings.status_timeout();
    let channels = self.channels.as_mut().ok_or(AggregatorError::NotLaunched)?;
    let started = Instant::now();

    loop {
      let remaining = timeout.saturating_sub(started.elapsed());
      match channels.recv_status_timeout(remaining).await? {
        Some(StatusSample::Sample(depth)) => {
          self.last_status = Some((depth, Instant::now()));
          return Ok(depth);
        }
        Some(StatusSample::Rendezvous(addr)) => {
          warn!(%addr, "Ignoring repeated listener address");
        }
        None => {
          return Err(AggregatorError::ListenerUnresponsive {
            elapsed: started.elapsed(),
          });
        }
      }
    }
  }

  /// The latest queue depth without waiting.
  ///
  /// Falls back to [`get_status`](Self::get_status) if no sample has ever
  /// arrived. Fails if the latest sample is older than the status timeout.
  pub async fn get_most_recent_status(&mut self) -> Result<usize, AggregatorError> {
    let Some((mut depth, mut received_at)) = self.last_status else {
      return self.get_status().await;
    };

    let channels = self.channels.as_mut().ok_or(AggregatorError::NotLaunched)?;
    while let Some(sample) = channels.try_status()? {
      match sample {
        StatusSample::Sample(latest) => {
          depth = latest;
          received_at = Instant::now();
        }
        StatusSample::Rendezvous(addr) => {
          warn!(%addr, "Ignoring repeated listener address");
        }
      }
    }
    self.last_status = Some((depth, received_at));

    let elapsed = received_at.elapsed();
    if elapsed > self.settings.status_timeout() {
      return Err(AggregatorError::ListenerUnresponsive { elapsed });
    }
    Ok(depth)
  }

  /// Visit ids finalized since the last call, in order.
  pub fn get_saved_visit_ids(&mut self) -> Vec<VisitId> {
    match self.channels.as_mut() {
      Some(channels) => channels.drain_completions(),
      None => Vec::new(),
    }
  }

  /// Ask the listener to stop and wait for it, up to the shutdown deadline.
  ///
  /// Past the deadline the listener is killed and `TimedOut` returned. A
  /// listener that ends in time but reports an error, panics or exits
  /// non-zero gives `Failed`. The rendezvous address and process handle are
  /// cleared in every case.
  pub async fn shutdown(&mut self) -> Result<ShutdownOutcome, AggregatorError> {
    if self.state != AggregatorState::Launched {
      return Err(AggregatorError::NotLaunched);
    }
    let process = self.process.take().ok_or(AggregatorError::NotLaunched)?;
    let channels = self.channels.as_ref().ok_or(AggregatorError::NotLaunched)?;

    self.state = AggregatorState::ShuttingDown;
    info!("Sending shutdown signal to listener");
    if let Err(e) = channels.send_shutdown() {
      warn!(error = %e, "Listener stopped listening for shutdown");
    }

    let deadline = self.settings.shutdown_timeout();
    let started = Instant::now();
    let outcome = match process.join(deadline).await {
      Exit::Exited => ShutdownOutcome::Stopped {
        elapsed: started.elapsed(),
      },
      Exit::Failed(reason) => ShutdownOutcome::Failed {
        elapsed: started.elapsed(),
        reason,
      },
      Exit::TimedOut { killed } => {
        warn!(?deadline, killed, "Listener did not stop in time");
        ShutdownOutcome::TimedOut {
          waited: started.elapsed(),
          killed,
        }
      }
    };

    self.listener_address = None;
    self.state = AggregatorState::Stopped;
    info!(?outcome, "Listener shut down");
    Ok(outcome)
  }
}

