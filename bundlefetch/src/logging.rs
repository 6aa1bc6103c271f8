//! Logging setup for binaries embedding the orchestrator.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the application. [`init_logging`] is the standard setup:
//!
//! - stderr output for interactive use
//! - a daily-rolling file under the given directory, written off-thread
//! - `RUST_LOG` filtering, defaulting to `info` (`debug` when verbose)

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{DownloadError, DownloadResult};

/// Log file name prefix; the appender adds a date suffix.
pub const LOG_FILE_NAME: &str = "bundlefetch.log";

/// Keeps the background log writer alive. Flushes pending lines on drop.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: WorkerGuard,
}

/// Default filter directive for the given verbosity.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "bundlefetch=debug,info"
    } else {
        "info"
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if the log directory cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(log_dir: &Path, verbose: bool) -> DownloadResult<LoggingGuard> {
    std::fs::create_dir_all(log_dir).map_err(|e| DownloadError::io(log_dir, e))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(LocalTime::rfc_3339())
        .with_target(false);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_timer(LocalTime::rfc_3339())
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| DownloadError::InvalidConfig(format!("logging: {}", e)))?;

    Ok(LoggingGuard { _file: guard })
}
