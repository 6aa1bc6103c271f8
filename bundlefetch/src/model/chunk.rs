//! Byte-range chunks and their lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::task::TaskId;
use crate::error::{DownloadError, DownloadResult};

/// Lifecycle status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Waiting to be dispatched.
    Pending,
    /// A transfer is in flight.
    Downloading,
    /// Transferred, verified and promoted into the chunk area.
    Completed,
    /// Last attempt failed; may be retried while budget remains.
    Failed,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Where a chunk's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocator {
    /// URL to fetch.
    pub url: String,
    /// Whether a `Range` header selecting the chunk's bytes must be sent.
    ///
    /// `false` when the URL serves exactly this chunk (one URL per chunk).
    pub ranged: bool,
}

impl ChunkLocator {
    /// Locator for a byte range of a shared base URL.
    pub fn ranged(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ranged: true,
        }
    }

    /// Locator for a URL that serves the whole chunk.
    pub fn whole(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ranged: false,
        }
    }
}

/// One byte-range unit of transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChunk {
    /// Stable identifier, `<task-id>:<index>`.
    pub id: String,
    /// Parent task.
    pub task_id: TaskId,
    /// Zero-based position within the artifact.
    pub index: u32,
    /// Byte offset within the artifact.
    pub offset: u64,
    /// Number of bytes in this chunk.
    pub size: u64,
    /// Source of the bytes.
    pub locator: ChunkLocator,
    /// Current lifecycle status.
    pub status: ChunkStatus,
    /// Bytes transferred by the current (or last) attempt.
    pub downloaded_bytes: u64,
    /// Expected SHA-256 digest, when the manifest supplies one.
    pub expected_digest: Option<String>,
    /// Digest computed when the chunk was committed.
    #[serde(default)]
    pub actual_digest: Option<String>,
    /// Whether the committed bytes matched `expected_digest`.
    #[serde(default)]
    pub verified: bool,
    /// Number of failed attempts. Never decreases.
    pub retry_count: u32,
    /// Description of the most recent failure.
    pub last_error: Option<String>,
}

impl DownloadChunk {
    /// Create a pending chunk.
    pub fn new(
        task_id: &TaskId,
        index: u32,
        offset: u64,
        size: u64,
        locator: ChunkLocator,
        expected_digest: Option<String>,
    ) -> Self {
        Self {
            id: format!("{}:{}", task_id, index),
            task_id: task_id.clone(),
            index,
            offset,
            size,
            locator,
            status: ChunkStatus::Pending,
            downloaded_bytes: 0,
            expected_digest,
            actual_digest: None,
            verified: false,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Inclusive byte range, as used in a `Range: bytes=a-b` header.
    pub fn byte_range(&self) -> (u64, u64) {
        (self.offset, self.offset + self.size - 1)
    }

    /// Fraction of this chunk transferred so far (0.0 to 1.0).
    pub fn fraction(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        self.downloaded_bytes as f64 / self.size as f64
    }

    /// Whether the chunk may be dispatched, given the retry ceiling.
    ///
    /// Backoff timing is tracked by the scheduler, not here.
    pub fn has_budget(&self, ceiling: u32) -> bool {
        match self.status {
            ChunkStatus::Pending => true,
            ChunkStatus::Failed => self.retry_count < ceiling,
            ChunkStatus::Downloading | ChunkStatus::Completed => false,
        }
    }

    /// `pending | failed` → `downloading`.
    pub fn begin(&mut self) -> DownloadResult<()> {
        match self.status {
            ChunkStatus::Pending | ChunkStatus::Failed => {
                self.status = ChunkStatus::Downloading;
                self.downloaded_bytes = 0;
                Ok(())
            }
            from => Err(self.transition_error(from, ChunkStatus::Downloading)),
        }
    }

    /// Record cumulative transferred bytes for the in-flight attempt.
    pub fn record_progress(&mut self, bytes: u64) {
        if self.status == ChunkStatus::Downloading {
            self.downloaded_bytes = bytes.min(self.size);
        }
    }

    /// `downloading` → `completed`.
    pub fn complete(&mut self, digest: String, verified: bool) -> DownloadResult<()> {
        if self.status != ChunkStatus::Downloading {
            return Err(self.transition_error(self.status, ChunkStatus::Completed));
        }
        self.status = ChunkStatus::Completed;
        self.downloaded_bytes = self.size;
        self.actual_digest = Some(digest);
        self.verified = verified;
        self.last_error = None;
        Ok(())
    }

    /// `downloading` → `failed`, consuming one unit of retry budget.
    ///
    /// Returns the new retry count.
    pub fn fail(&mut self, error: impl Into<String>) -> DownloadResult<u32> {
        if self.status != ChunkStatus::Downloading {
            return Err(self.transition_error(self.status, ChunkStatus::Failed));
        }
        self.status = ChunkStatus::Failed;
        self.downloaded_bytes = 0;
        self.retry_count += 1;
        self.last_error = Some(error.into());
        Ok(self.retry_count)
    }

    /// `completed` → `failed` after the assembled artifact disagreed with its
    /// digest and this chunk was only provisionally accepted.
    pub fn invalidate(&mut self, error: impl Into<String>) -> DownloadResult<u32> {
        if self.status != ChunkStatus::Completed {
            return Err(self.transition_error(self.status, ChunkStatus::Failed));
        }
        self.status = ChunkStatus::Failed;
        self.downloaded_bytes = 0;
        self.actual_digest = None;
        self.verified = false;
        self.retry_count += 1;
        self.last_error = Some(error.into());
        Ok(self.retry_count)
    }

    /// Return an interrupted transfer (pause, restart) to `pending` without
    /// charging the retry budget.
    pub fn interrupt(&mut self) {
        if self.status == ChunkStatus::Downloading {
            self.status = ChunkStatus::Pending;
            self.downloaded_bytes = 0;
        }
    }

    /// Forget committed bytes whose file went missing; back to `pending`
    /// without charging the retry budget.
    pub fn reset(&mut self) {
        self.status = ChunkStatus::Pending;
        self.downloaded_bytes = 0;
        self.actual_digest = None;
        self.verified = false;
    }

    fn transition_error(&self, from: ChunkStatus, to: ChunkStatus) -> DownloadError {
        DownloadError::InvalidTransition {
            chunk: self.id.clone(),
            from,
            to,
        }
    }
}
