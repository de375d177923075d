//! Logging setup for the aggregator, the listener child and one-shot commands

use crawlsink::config::LoggingSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

/// Initialize logging for one-shot commands (console only)
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .with_writer(std::io::stderr)
    .init();
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> LevelFilter {
  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Config level as the default directive; RUST_LOG wins
fn env_filter(settings: &LoggingSettings) -> EnvFilter {
  EnvFilter::builder()
    .with_default_directive(parse_log_level(&settings.level).into())
    .from_env_lossy()
}

/// Initialize logging for the aggregator (`crawlsink run`): console with colors
pub fn init_run_logging(settings: &LoggingSettings) {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(settings))
    .with_target(true)
    .with_ansi(true)
    .init();
}

/// Initialize logging for the listener child process.
///
/// Stdout carries control frames, so logs go to stderr (inherited from the
/// aggregator) or, when `log_dir` is configured, to a daily-rotated file.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_listener_logging(settings: &LoggingSettings) -> Option<WorkerGuard> {
  let filter = env_filter(settings);

  let Some(log_dir) = settings.log_dir.as_ref() else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_target(true)
      .with_ansi(false)
      .with_writer(std::io::stderr)
      .init();
    return None;
  };

  if std::fs::create_dir_all(log_dir).is_err() {
    // Fall back to stderr
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_ansi(false)
      .with_writer(std::io::stderr)
      .init();
    return None;
  }

  let file_appender = tracing_appender::rolling::daily(log_dir, "listener.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
