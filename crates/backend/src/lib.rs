pub mod aggregator;
pub mod control;
pub mod dirs;
pub mod listener;
pub mod storage;
pub mod transport;

mod domain;
pub use aggregator::{
  Aggregator, AggregatorError, AggregatorState, Launcher, ProcessLauncher, ShutdownOutcome, TaskLauncher,
};
pub use domain::{config, record};
pub use listener::{Listener, ListenerError, ListenerState, listener_entry, run_stdio_listener};
