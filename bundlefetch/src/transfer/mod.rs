//! Chunk transfer workers.
//!
//! A [`ChunkTransfer`] moves the bytes of one chunk from the network into an
//! isolated temp file. It knows nothing about tasks, retries or persistence;
//! the orchestrator decides what a result means.
//!
//! # Design Principles
//!
//! - **Isolated output**: each attempt writes its own temp file, owned by the
//!   worker until the orchestrator promotes it
//! - **Cooperative cancellation**: a `CancellationToken` stops the transfer
//!   and removes the temp file
//! - **Dyn-compatible**: uses `Pin<Box<dyn Future>>` for trait object support
//! - **Errors, not panics**: every transport failure is a [`TransferError`]

mod http;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use http::{HttpTransfer, RemoteInfo};

/// Boxed future used by dyn-compatible async traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback receiving the cumulative byte count of the current attempt.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Transport-level failures. All of them are retryable.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The request or body read timed out.
    #[error("request timed out")]
    Timeout,

    /// The server answered with an unexpected status.
    #[error("unexpected HTTP status {status}")]
    Http { status: u16 },

    /// Connection could not be established or was dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// Writing the temp file failed.
    #[error("temp file error: {0}")]
    Io(#[from] std::io::Error),

    /// The transfer was cancelled before it finished.
    #[error("transfer cancelled")]
    Cancelled,

    /// The body was shorter or longer than the planned chunk size.
    #[error("expected {expected} bytes, received {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
}

/// One chunk transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// URL to fetch.
    pub url: String,
    /// Inclusive byte range to request, `None` to fetch the whole resource.
    pub range: Option<(u64, u64)>,
    /// Exact number of bytes the body must contain.
    pub expected_len: u64,
    /// Temp file the body is written to.
    pub temp_path: PathBuf,
}

impl TransferRequest {
    /// Value of the `Range` header, if any.
    pub fn range_header(&self) -> Option<String> {
        self.range
            .map(|(start, end)| format!("bytes={}-{}", start, end))
    }
}

/// A finished transfer: the temp file holds exactly `bytes` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Fetches chunk bytes into a temp file.
pub trait ChunkTransfer: Send + Sync + 'static {
    /// Transfer `request` into `request.temp_path`.
    ///
    /// `progress` is invoked with cumulative bytes as they arrive. On any
    /// error, including cancellation, the temp file is removed.
    fn fetch(
        &self,
        request: TransferRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<TransferReceipt, TransferError>>;
}
