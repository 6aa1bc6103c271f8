//! Download requests handed to the orchestrator by content discovery.

use std::path::PathBuf;

use super::task::{ContentType, Priority};

/// Where an artifact's chunks are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSource {
    /// One base URL; each chunk is a byte-range request against it.
    Ranged { url: String },
    /// One URL per chunk, in index order. Each URL serves exactly one chunk.
    PerChunk { urls: Vec<String> },
}

/// A request to deliver one artifact.
///
/// Built with [`DownloadRequest::ranged`] or [`DownloadRequest::per_chunk`]
/// and refined with the `with_*` methods.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub content_type: ContentType,
    pub total_size: u64,
    pub priority: Priority,
    pub source: ChunkSource,
    /// Overrides the configured chunk size. Required for per-chunk sources.
    pub chunk_size: Option<u64>,
    /// Expected SHA-256 of each planned chunk, in index order.
    pub chunk_digests: Option<Vec<String>>,
    /// Expected SHA-256 of the assembled artifact.
    pub artifact_digest: Option<String>,
    /// Final artifact path. Defaults to `<output_dir>/<task-id>.bin`.
    pub destination: Option<PathBuf>,
    /// Label shown in listings.
    pub label: Option<String>,
}

impl DownloadRequest {
    /// Request an artifact served from a single range-capable URL.
    pub fn ranged(url: impl Into<String>, total_size: u64) -> Self {
        Self::with_source(ChunkSource::Ranged { url: url.into() }, total_size)
    }

    /// Request an artifact served as one URL per chunk.
    pub fn per_chunk(urls: Vec<String>, chunk_size: u64, total_size: u64) -> Self {
        let mut request = Self::with_source(ChunkSource::PerChunk { urls }, total_size);
        request.chunk_size = Some(chunk_size);
        request
    }

    fn with_source(source: ChunkSource, total_size: u64) -> Self {
        Self {
            content_type: ContentType::OptionalModule,
            total_size,
            priority: Priority::default(),
            source,
            chunk_size: None,
            chunk_digests: None,
            artifact_digest: None,
            destination: None,
            label: None,
        }
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Supply per-chunk digests.
    pub fn with_chunk_digests(mut self, digests: Vec<String>) -> Self {
        self.chunk_digests = Some(digests);
        self
    }

    /// Supply the whole-artifact digest.
    pub fn with_artifact_digest(mut self, digest: impl Into<String>) -> Self {
        self.artifact_digest = Some(digest.into());
        self
    }

    /// Set the final artifact path.
    pub fn with_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    /// Set the listing label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
