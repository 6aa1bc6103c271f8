//! Bundlefetch - resumable, verified delivery of large content bundles
//!
//! Large archives are split into fixed-size chunks, transferred with bounded
//! concurrency, verified with SHA-256, persisted after every state change and
//! assembled atomically once every chunk is proven correct.
//!
//! # Modules
//!
//! - [`orchestrator`]: the engine, its public handle and listener callbacks
//! - [`model`]: tasks, chunks and requests
//! - [`planner`]: deterministic chunk planning
//! - [`storage`]: free-space admission
//! - [`transfer`]: chunk transfers (HTTP range requests)
//! - [`verify`]: SHA-256 verification
//! - [`store`]: durable task persistence
//! - [`manifest`]: content manifest parsing
//! - [`config`] and [`logging`]: ambient setup for embedders and the CLI

pub mod config;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod storage;
pub mod store;
pub mod transfer;
pub mod verify;

pub use config::{ConfigFile, DownloadConfig};
pub use error::{DownloadError, DownloadResult};
pub use model::{
    ChunkSource, ChunkStatus, ContentType, DownloadChunk, DownloadRequest, DownloadTask, Priority,
    TaskId, TaskStatus,
};
pub use orchestrator::{
    CompletedArtifact, DownloadListener, DownloadOrchestrator, DownloadProgress, RetryPolicy,
};
pub use storage::StorageInfo;
