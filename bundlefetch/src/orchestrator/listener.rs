//! Push-style notifications to the UI / control layer.

use std::path::PathBuf;

use tokio::sync::mpsc;

use super::progress::DownloadProgress;
use crate::error::DownloadError;
use crate::model::TaskId;

/// A delivered artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedArtifact {
    pub task_id: TaskId,
    /// Final location of the artifact.
    pub path: PathBuf,
    pub size: u64,
    /// SHA-256 of the assembled bytes.
    pub sha256: String,
    /// Whether `sha256` was checked against a known digest.
    pub verified: bool,
}

/// Receives task progress and terminal outcomes.
///
/// Callbacks run on the orchestrator's engine task and must return quickly;
/// forward to a channel (see [`ChannelListener`]) for anything slow.
pub trait DownloadListener: Send + Sync {
    /// Throttled progress for a task that is transferring.
    fn on_progress(&self, _task_id: &TaskId, _progress: &DownloadProgress) {}

    /// Exactly one terminal outcome per task: completed, failed (e.g.
    /// `RetriesExhausted`) or `Cancelled`.
    fn on_complete(&self, _task_id: &TaskId, _outcome: Result<CompletedArtifact, DownloadError>) {}
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl DownloadListener for NoopListener {}

/// Event forwarded by [`ChannelListener`].
#[derive(Debug)]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    Finished {
        task_id: TaskId,
        outcome: Result<CompletedArtifact, DownloadError>,
    },
}

/// Listener forwarding notifications into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DownloadListener for ChannelListener {
    fn on_progress(&self, _task_id: &TaskId, progress: &DownloadProgress) {
        // Receiver gone means nobody is watching
        let _ = self.tx.send(DownloadEvent::Progress(progress.clone()));
    }

    fn on_complete(&self, task_id: &TaskId, outcome: Result<CompletedArtifact, DownloadError>) {
        let _ = self.tx.send(DownloadEvent::Finished {
            task_id: task_id.clone(),
            outcome,
        });
    }
}
