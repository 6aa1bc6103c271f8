//! Task and chunk data model.
//!
//! - [`DownloadTask`]: one artifact, its chunk plan and lifecycle
//! - [`DownloadChunk`]: one byte range and its transfer lifecycle
//! - [`DownloadRequest`]: what content discovery asks the orchestrator for

mod chunk;
mod request;
mod task;

pub use chunk::{ChunkLocator, ChunkStatus, DownloadChunk};
pub use request::{ChunkSource, DownloadRequest};
pub use task::{ContentType, DownloadTask, Priority, TaskId, TaskStatus};
