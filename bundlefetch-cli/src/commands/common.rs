//! Common types and utilities shared across CLI commands.

use std::collections::HashMap;
use std::sync::Arc;

use clap::ValueEnum;
use console::style;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Notify};
use tracing::warn;

use bundlefetch::orchestrator::{DownloadEvent, DownloadOrchestrator};
use bundlefetch::{
    CompletedArtifact, ContentType, DownloadError, DownloadProgress, DownloadTask, Priority,
    TaskId,
};

use crate::error::CliError;

/// Priority selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}

/// Content type selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum ContentTypeArg {
    /// Core content the application needs to work
    Essential,
    /// Optional add-on module
    Module,
    /// Replacement for installed content
    Update,
}

impl From<ContentTypeArg> for ContentType {
    fn from(arg: ContentTypeArg) -> Self {
        match arg {
            ContentTypeArg::Essential => ContentType::EssentialBundle,
            ContentTypeArg::Module => ContentType::OptionalModule,
            ContentTypeArg::Update => ContentType::Update,
        }
    }
}

/// Parse a byte size with an optional K/M/G suffix (binary units).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 1024),
        Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", s))?;
    value
        .checked_mul(multiplier)
        .filter(|bytes| *bytes > 0)
        .ok_or_else(|| format!("invalid size '{}'", s))
}

/// Install a Ctrl+C handler that wakes the returned notifier.
pub fn interrupt_signal() -> Result<Arc<Notify>, CliError> {
    let notify = Arc::new(Notify::new());
    let handler = Arc::clone(&notify);
    ctrlc::set_handler(move || handler.notify_one())
        .map_err(|e| CliError::Config(format!("failed to install Ctrl+C handler: {}", e)))?;
    Ok(notify)
}

/// Outcome counts of a watch loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchSummary {
    pub completed: usize,
    pub failed: usize,
}

impl WatchSummary {
    /// Convert failures into the CLI error.
    pub fn into_result(self) -> Result<(), CliError> {
        if self.failed == 0 {
            Ok(())
        } else {
            Err(CliError::DownloadsFailed {
                failed: self.failed,
                total: self.completed + self.failed,
            })
        }
    }
}

/// One progress bar per watched task.
pub struct ProgressBoard {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    pub fn add(&mut self, task: &DownloadTask) {
        let bar = self.multi.add(ProgressBar::new(task.total_size));
        bar.set_style(bar_style());
        bar.set_prefix(task_label(task));
        bar.set_position(task.completed_bytes());
        bar.set_message(format!(
            "{}/{} chunks",
            task.completed_chunks(),
            task.total_chunks()
        ));
        self.bars.insert(task.id.clone(), bar);
    }

    pub fn update(&self, progress: &DownloadProgress) {
        if let Some(bar) = self.bars.get(&progress.task_id) {
            bar.set_position(progress.downloaded_bytes);
            bar.set_message(format!(
                "{}/{} chunks, {}/s",
                progress.chunks_completed,
                progress.chunks_total,
                HumanBytes(progress.speed_bytes_per_sec as u64)
            ));
        }
    }

    pub fn finish(&self, task_id: &TaskId, outcome: &Result<CompletedArtifact, DownloadError>) {
        let Some(bar) = self.bars.get(task_id) else {
            return;
        };
        match outcome {
            Ok(artifact) => {
                bar.set_position(artifact.size);
                let check = if artifact.verified {
                    style("verified").green()
                } else {
                    style("unverified").yellow()
                };
                bar.finish_with_message(format!("{} {}", check, artifact.path.display()));
            }
            Err(e) => bar.abandon_with_message(format!("{}", style(e).red())),
        }
    }

    pub fn abandon_all(&self, message: &str) {
        for bar in self.bars.values().filter(|bar| !bar.is_finished()) {
            bar.abandon_with_message(message.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Short display name for a task.
pub fn task_label(task: &DownloadTask) -> String {
    task.label.clone().unwrap_or_else(|| short_id(&task.id))
}

/// First eight characters of a task id.
pub fn short_id(id: &TaskId) -> String {
    id.as_str().chars().take(8).collect()
}

/// Drive the progress board until every watched task has an outcome.
///
/// Ctrl+C pauses every transferring task and shuts the orchestrator down so
/// a later `resume` continues from the persisted chunks.
pub async fn watch(
    orchestrator: &DownloadOrchestrator,
    events: &mut mpsc::UnboundedReceiver<DownloadEvent>,
    board: &ProgressBoard,
    interrupt: &Notify,
) -> Result<WatchSummary, CliError> {
    let mut pending = board.len();
    let mut summary = WatchSummary::default();

    while pending > 0 {
        tokio::select! {
            _ = interrupt.notified() => {
                let paused = orchestrator.pause_all().await?;
                board.abandon_all("paused");
                orchestrator.shutdown().await?;
                return Err(CliError::Interrupted { paused: paused.len() });
            }
            event = events.recv() => match event {
                Some(DownloadEvent::Progress(progress)) => board.update(&progress),
                Some(DownloadEvent::Finished { task_id, outcome }) => {
                    if !board.bars.contains_key(&task_id) {
                        continue;
                    }
                    board.finish(&task_id, &outcome);
                    match &outcome {
                        Ok(_) => summary.completed += 1,
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Download failed");
                            summary.failed += 1;
                        }
                    }
                    pending -= 1;
                }
                None => break,
            },
        }
    }

    Ok(summary)
}
