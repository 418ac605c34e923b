//! Logging setup
//!
//! Two sinks: a compact console layer for interactive runs and a daily
//! rotating JSON file for post-mortem digging. Source file and line are
//! recorded only in the JSON layer; the console stays scannable. The filter
//! comes from `RUST_LOG` (default `info`), the file directory from
//! `LANPULSE_LOG_DIR` or the platform data dir, next to the store.

use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "lanpulse.log";

/// Initialize both log sinks, returning the directory receiving log files.
///
/// A subscriber installed earlier (tests, embedders) wins; that is reported
/// on stderr and never fails startup.
pub fn init_logging() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let log_dir = log_directory()?;
    std::fs::create_dir_all(&log_dir)?;

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);

    let install = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .compact(),
        )
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .try_init();

    match install {
        Ok(()) => tracing::info!(
            "Logging to {}",
            current_log_file(&log_dir).display()
        ),
        Err(e) => eprintln!("[WARN] keeping existing log subscriber: {}", e),
    }

    Ok(log_dir)
}

/// Path today's entries rotate into, for surfacing in diagnostics.
pub fn current_log_file(log_dir: &Path) -> PathBuf {
    let today = chrono::Local::now().format("%Y-%m-%d");
    log_dir.join(format!("{}.{}", LOG_FILE_PREFIX, today))
}

fn log_directory() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(dir) = std::env::var("LANPULSE_LOG_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let base = dirs::data_dir().ok_or("Could not find data directory")?;
    Ok(base.join("lanpulse").join("logs"))
}
