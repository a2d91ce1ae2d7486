//! Tracing setup.
//!
//! Interactive commands log to a daily file so stdout stays clean for output;
//! `serve` logs to stderr. The filter comes from `RELEVE_LOG` (default `info`).

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const FILTER_ENV: &str = "RELEVE_LOG";

fn filter() -> EnvFilter {
  EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("releve").join("logs"))
}

/// Log to `<data_dir>/releve/logs/releve.log.<date>`. Keep the guard alive
/// until exit or buffered lines are lost.
pub fn init_file() -> Result<WorkerGuard> {
  let dir = log_dir().ok_or_else(|| eyre!("No data directory for log files"))?;
  std::fs::create_dir_all(&dir)?;

  let appender = tracing_appender::rolling::daily(&dir, "releve.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(
      fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(filter()),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  tracing::debug!(dir = %dir.display(), "File logging initialized");
  Ok(guard)
}

pub fn init_stderr() -> Result<()> {
  tracing_subscriber::registry()
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(filter()),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))
}
