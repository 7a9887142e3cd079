//! Tracing setup for the command line.
//!
//! Logs go to stderr so stdout stays free for command output. With a log
//! directory configured, a daily rolling file receives the same events.

use color_eyre::{eyre::eyre, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Map the number of `-v` flags to a level.
pub fn level_for_verbosity(verbose: u8) -> Level {
  match verbose {
    0 => Level::WARN,
    1 => Level::INFO,
    2 => Level::DEBUG,
    _ => Level::TRACE,
  }
}

/// `RUST_LOG` wins; otherwise our own crate logs at `level` and dependencies stay quiet.
fn build_env_filter(level: Level) -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    let level = level.to_string().to_lowercase();
    EnvFilter::new(format!("warn,osp_worker={level}"))
  })
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop, so it has to live
/// until the program exits.
pub fn init_logging(config: &LogConfig, level: Level) -> Result<Option<WorkerGuard>> {
  let stderr_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .compact();

  let (file_layer, guard) = match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

      let appender = tracing_appender::rolling::daily(directory, "osp-worker.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(build_env_filter(level))
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_verbosity_levels() {
    assert_eq!(level_for_verbosity(0), Level::WARN);
    assert_eq!(level_for_verbosity(1), Level::INFO);
    assert_eq!(level_for_verbosity(2), Level::DEBUG);
    assert_eq!(level_for_verbosity(9), Level::TRACE);
  }
}
