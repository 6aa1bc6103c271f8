//! Error types for the download orchestrator.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{ChunkStatus, TaskId, TaskStatus};
use crate::transfer::TransferError;

/// Result type for orchestrator operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors that can occur while planning, transferring or assembling artifacts.
///
/// Only task-level outcomes ever reach a caller's completion callback:
/// `RetriesExhausted`, `IntegrityMismatch` (for fully-verified artifacts whose
/// top-level digest still disagrees) and `Cancelled`. Chunk-level failures are
/// absorbed and retried by the orchestrator.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Not enough free space (after the safety margin) to accept the artifact.
    #[error("insufficient storage: {required} bytes required, {available} bytes available")]
    InsufficientStorage { required: u64, available: u64 },

    /// Filesystem statistics could not be read; treated as a rejection.
    #[error("storage statistics unavailable for {}: {source}", path.display())]
    StorageUnavailable { path: PathBuf, source: io::Error },

    /// The request is malformed (zero size, mismatched digest list, ...).
    #[error("invalid download request: {0}")]
    InvalidRequest(String),

    /// No task with the given id exists.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The operation is not valid for the task's current status.
    #[error("cannot {operation} task {task_id} while {status}")]
    InvalidState {
        task_id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    /// A chunk was asked to make a lifecycle transition it does not allow.
    #[error("chunk {chunk} cannot move from {from} to {to}")]
    InvalidTransition {
        chunk: String,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    /// A chunk transfer failed at the transport level.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Computed digest does not match the expected digest.
    #[error("integrity mismatch for {subject}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    /// A chunk failed more often than the retry policy allows.
    #[error("chunk {chunk_index} of task {task_id} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        task_id: TaskId,
        chunk_index: u32,
        attempts: u32,
        last_error: String,
    },

    /// The caller cancelled the task.
    #[error("download cancelled")]
    Cancelled,

    /// Another orchestrator already owns the task store.
    #[error("task store {} is locked by another process", path.display())]
    StoreLocked { path: PathBuf },

    /// The task store could not be read or written.
    #[error("task store error: {0}")]
    Store(String),

    /// Filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The orchestrator engine has stopped.
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl DownloadError {
    /// Build an [`DownloadError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the orchestrator retries this error automatically.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transfer(_)
                | Self::IntegrityMismatch { .. }
                | Self::Io { .. }
                | Self::InsufficientStorage { .. }
                | Self::StorageUnavailable { .. }
        )
    }
}
