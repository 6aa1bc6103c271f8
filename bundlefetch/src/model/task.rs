//! Download task state.
//!
//! A [`DownloadTask`] is the durable record of one artifact being delivered:
//! its planned chunks, scheduling priority, lifecycle status and timestamps.
//! The orchestrator engine is the only writer; the task store mirrors it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::chunk::{ChunkStatus, DownloadChunk};
use crate::error::{DownloadError, DownloadResult};

/// Opaque, stable task identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What kind of content an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    /// Core content the application cannot work without.
    EssentialBundle,
    /// Add-on content the user opted into.
    OptionalModule,
    /// Replacement for previously installed content.
    Update,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EssentialBundle => "essential-bundle",
            Self::OptionalModule => "optional-module",
            Self::Update => "update",
        };
        f.write_str(name)
    }
}

impl FromStr for ContentType {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "essential-bundle" | "essential" => Ok(Self::EssentialBundle),
            "optional-module" | "optional" | "module" => Ok(Self::OptionalModule),
            "update" => Ok(Self::Update),
            other => Err(DownloadError::InvalidRequest(format!(
                "unknown content type '{}'",
                other
            ))),
        }
    }
}

/// Task scheduling priority.
///
/// Ordered so that more important work compares greater:
/// `Critical > High > Medium > Low`. Critical content starves lower
/// priorities; it is expected to be small.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

impl FromStr for Priority {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(DownloadError::InvalidRequest(format!(
                "unknown priority '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether chunk results for a task in this status may still be committed.
    pub fn accepts_results(&self) -> bool {
        matches!(self, Self::Downloading | Self::Paused)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One logical artifact being delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub content_type: ContentType,
    pub priority: Priority,
    /// Declared artifact size in bytes.
    pub total_size: u64,
    /// Chunk size the plan was produced with.
    pub chunk_size: u64,
    /// Planned chunks, ordered by index. Membership never changes.
    pub chunks: Vec<DownloadChunk>,
    pub status: TaskStatus,
    /// Where the assembled artifact is placed.
    pub destination: PathBuf,
    /// Expected SHA-256 of the whole artifact, when known.
    pub artifact_digest: Option<String>,
    /// Free-form label shown in listings (module name, file name).
    #[serde(default)]
    pub label: Option<String>,
    /// Number of caller-initiated retries after a terminal failure.
    #[serde(default)]
    pub retry_rounds: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal error description for failed tasks.
    pub error: Option<String>,
}

impl DownloadTask {
    /// Check the structural invariants of the chunk plan.
    ///
    /// Chunk sizes must sum to `total_size`, indices must be contiguous from
    /// zero and byte ranges must be contiguous and non-overlapping.
    pub fn validate(&self) -> DownloadResult<()> {
        let mut expected_offset = 0u64;
        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != position {
                return Err(DownloadError::InvalidRequest(format!(
                    "task {}: chunk at position {} has index {}",
                    self.id, position, chunk.index
                )));
            }
            if chunk.size == 0 {
                return Err(DownloadError::InvalidRequest(format!(
                    "task {}: chunk {} is empty",
                    self.id, chunk.index
                )));
            }
            if chunk.offset != expected_offset {
                return Err(DownloadError::InvalidRequest(format!(
                    "task {}: chunk {} starts at {} but previous chunk ends at {}",
                    self.id, chunk.index, chunk.offset, expected_offset
                )));
            }
            if chunk.downloaded_bytes > chunk.size {
                return Err(DownloadError::InvalidRequest(format!(
                    "task {}: chunk {} reports more bytes than it holds",
                    self.id, chunk.index
                )));
            }
            expected_offset += chunk.size;
        }

        if expected_offset != self.total_size {
            return Err(DownloadError::InvalidRequest(format!(
                "task {}: chunks cover {} bytes, declared size is {}",
                self.id, expected_offset, self.total_size
            )));
        }
        Ok(())
    }

    /// Retry ceiling for this task's chunks, given the failures allowed per
    /// retry round.
    pub fn chunk_ceiling(&self, per_round: u32) -> u32 {
        per_round.saturating_mul(self.retry_rounds + 1)
    }

    /// Number of chunks in the plan.
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Number of chunks in `completed` status.
    pub fn completed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count()
    }

    /// Bytes held by completed chunks.
    pub fn completed_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.size)
            .sum()
    }

    /// Bytes held by completed chunks plus in-flight progress.
    pub fn downloaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| match c.status {
                ChunkStatus::Completed => c.size,
                ChunkStatus::Downloading => c.downloaded_bytes,
                _ => 0,
            })
            .sum()
    }

    /// Whether every chunk has been transferred and committed.
    pub fn is_fully_transferred(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.status == ChunkStatus::Completed)
    }

    /// Progress as a percentage of declared bytes.
    pub fn progress_percent(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.downloaded_bytes() as f64 / self.total_size as f64) * 100.0
    }

    /// Progress as a ratio (0.0 to 1.0).
    pub fn progress_ratio(&self) -> f64 {
        self.progress_percent() / 100.0
    }

    /// Look up a chunk by index.
    pub fn chunk(&self, index: u32) -> Option<&DownloadChunk> {
        self.chunks.get(index as usize)
    }

    /// Look up a chunk mutably by index.
    pub fn chunk_mut(&mut self, index: u32) -> Option<&mut DownloadChunk> {
        self.chunks.get_mut(index as usize)
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Set a new status and bump `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        if status == TaskStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Return every in-flight chunk to `pending` (pause, restart).
    pub fn interrupt_transfers(&mut self) -> usize {
        let mut interrupted = 0;
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::Downloading {
                chunk.interrupt();
                interrupted += 1;
            }
        }
        interrupted
    }
}
