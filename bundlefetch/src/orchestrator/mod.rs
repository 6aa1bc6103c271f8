//! Download orchestration
//!
//! Splits artifacts into chunks, schedules bounded-concurrency transfers,
//! retries failures with backoff, verifies every chunk and assembles the
//! final artifact once all of them are committed.

mod assembly;
mod engine;
mod handle;
mod layout;
mod listener;
mod machine;
mod policy;
mod progress;

pub use handle::{DownloadOrchestrator, OrchestratorBuilder, COMMAND_CHANNEL_CAPACITY};
pub use listener::{ChannelListener, CompletedArtifact, DownloadEvent, DownloadListener, NoopListener};
pub use policy::{RetryPolicy, DEFAULT_BASE_DELAY_SECS, DEFAULT_MAX_DELAY_SECS, DEFAULT_MAX_RETRIES};
pub use progress::{DownloadProgress, ThroughputMeter, DEFAULT_SPEED_WINDOW};
