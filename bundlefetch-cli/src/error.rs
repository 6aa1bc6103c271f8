//! CLI error type.

use thiserror::Error;

use bundlefetch::DownloadError;

/// Errors surfaced to the user. Any of these exits with status 1.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Failed to probe {url}: {reason}")]
    Probe { url: String, reason: String },

    #[error("{failed} of {total} download(s) failed")]
    DownloadsFailed { failed: usize, total: usize },

    #[error("Interrupted: paused {paused} task(s); run `bundlefetch resume` to continue")]
    Interrupted { paused: usize },

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
