//! The orchestrator engine.
//!
//! A single tokio task owns the [`Machine`] and is the only writer of task
//! state. Caller commands arrive over a bounded channel with oneshot replies;
//! chunk workers and assemblies report back over an unbounded event channel.
//!
//! ```text
//!  DownloadOrchestrator ──Command──► ┌────────────┐ ──spawn──► chunk worker ─┐
//!                                    │   Engine   │ ──spawn──► assembly ─────┤
//!       DownloadListener ◄─notify─── │ (Machine)  │ ◄──────WorkerEvent───────┘
//!                                    └─────┬──────┘
//!                                          ▼ persist
//!                                      TaskStore
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::assembly::{self, StagedArtifact};
use super::layout::{partial_path, WorkLayout};
use super::listener::{CompletedArtifact, DownloadListener};
use super::machine::{
    build_task, AssemblyGate, AssemblyPlan, Dispatch, FailureOutcome, Machine, PauseOutcome,
    ResumeOutcome,
};
use super::progress::{DownloadProgress, ThroughputMeter, DEFAULT_SPEED_WINDOW};
use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult};
use crate::model::{ChunkStatus, DownloadRequest, DownloadTask, TaskId, TaskStatus};
use crate::storage::{StorageAdvisor, StorageInfo};
use crate::store::TaskStore;
use crate::transfer::{ChunkTransfer, ProgressFn, TransferError, TransferRequest};
use crate::verify::{verify_chunk_blocking, Verification};

/// Caller request, answered through its oneshot.
pub(crate) enum Command {
    Start {
        request: DownloadRequest,
        reply: oneshot::Sender<DownloadResult<TaskId>>,
    },
    Pause {
        task_id: TaskId,
        reply: oneshot::Sender<DownloadResult<()>>,
    },
    Resume {
        task_id: TaskId,
        reply: oneshot::Sender<DownloadResult<()>>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<DownloadResult<()>>,
    },
    Progress {
        task_id: TaskId,
        reply: oneshot::Sender<DownloadResult<DownloadProgress>>,
    },
    List {
        reply: oneshot::Sender<Vec<DownloadTask>>,
    },
    StorageInfo {
        reply: oneshot::Sender<DownloadResult<StorageInfo>>,
    },
    PauseAll {
        reply: oneshot::Sender<Vec<TaskId>>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Output of a successful chunk worker.
#[derive(Debug)]
pub(crate) struct ChunkOutput {
    temp_path: PathBuf,
    verification: Verification,
}

/// Report from a worker or assembly back to the engine.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    ChunkProgress {
        task_id: TaskId,
        index: u32,
        seq: u64,
        bytes: u64,
    },
    ChunkFinished {
        task_id: TaskId,
        index: u32,
        seq: u64,
        result: DownloadResult<ChunkOutput>,
    },
    AssemblyFinished {
        task_id: TaskId,
        result: DownloadResult<StagedArtifact>,
    },
}

/// Collaborators injected into the engine.
pub(crate) struct EngineParts {
    pub config: DownloadConfig,
    pub storage: Arc<dyn StorageAdvisor>,
    pub store: Arc<dyn TaskStore>,
    pub transfer: Arc<dyn ChunkTransfer>,
    pub listener: Arc<dyn DownloadListener>,
}

pub(crate) struct Engine {
    machine: Machine,
    layout: WorkLayout,
    config: DownloadConfig,
    storage: Arc<dyn StorageAdvisor>,
    store: Arc<dyn TaskStore>,
    transfer: Arc<dyn ChunkTransfer>,
    listener: Arc<dyn DownloadListener>,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    meters: HashMap<TaskId, ThroughputMeter>,
    last_progress: HashMap<TaskId, Instant>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    workers: usize,
    assemblies: usize,
}

impl Engine {
    /// Build the engine and recover persisted tasks.
    pub fn new(parts: EngineParts, commands: mpsc::Receiver<Command>) -> DownloadResult<Self> {
        let EngineParts {
            config,
            storage,
            store,
            transfer,
            listener,
        } = parts;

        let tasks = store.load()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut engine = Self {
            machine: Machine::new(config.retry, config.max_concurrent_chunks),
            layout: WorkLayout::new(config.tasks_dir()),
            config,
            storage,
            store,
            transfer,
            listener,
            commands,
            events_tx,
            events_rx,
            meters: HashMap::new(),
            last_progress: HashMap::new(),
            idle_waiters: Vec::new(),
            workers: 0,
            assemblies: 0,
        };
        engine.recover(tasks)?;
        Ok(engine)
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self) {
        info!(
            tasks = self.machine.list().len(),
            max_concurrent = self.config.max_concurrent_chunks,
            "Download engine starting"
        );

        let shutdown_reply = loop {
            self.pump();
            self.notify_idle();
            let wakeup = self.machine.next_wakeup();

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => break Some(reply),
                    Some(command) => self.handle_command(command),
                    None => break None,
                },

                Some(event) = self.events_rx.recv() => self.handle_event(event),

                _ = sleep_until(wakeup) => {}
            }
        };

        let detached = self.machine.detach_all();
        if let Err(e) = self.persist() {
            error!(error = %e, "Failed to persist tasks on shutdown");
        }
        info!(detached, "Download engine stopped");

        // Release the store (and its lock) before acknowledging.
        drop(self);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    fn recover(&mut self, tasks: Vec<DownloadTask>) -> DownloadResult<()> {
        let loaded = tasks.len();
        self.machine.load(tasks);

        let tasks = self.machine.list();
        for task in &tasks {
            remove_dir_quietly(&self.layout.tmp_dir(&task.id));
            remove_file_quietly(&partial_path(&task.destination));
            let requeued = self.requeue_missing_chunks(task);
            if requeued > 0 {
                warn!(task_id = %task.id, chunks = requeued, "Committed chunks missing on disk, re-fetching");
            }
        }
        self.remove_orphan_task_dirs();

        if loaded > 0 {
            info!(tasks = loaded, "Recovered persisted download tasks");
        }
        if self.machine.take_dirty() {
            self.persist()?;
        }
        Ok(())
    }

    /// Reset completed chunks whose files are absent or the wrong length.
    fn requeue_missing_chunks(&mut self, task: &DownloadTask) -> usize {
        let mut requeued = 0;
        for chunk in task
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
        {
            let path = self.layout.chunk_path(&task.id, chunk.index);
            let intact = fs::metadata(&path)
                .map(|m| m.len() == chunk.size)
                .unwrap_or(false);
            if !intact {
                remove_file_quietly(&path);
                self.machine.requeue_chunk(&task.id, chunk.index);
                requeued += 1;
            }
        }
        requeued
    }

    fn remove_orphan_task_dirs(&self) {
        let Ok(entries) = fs::read_dir(self.layout.tasks_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let id = TaskId::from(name.to_string_lossy().as_ref());
            if self.machine.task(&id).is_none() {
                debug!(path = %entry.path().display(), "Removing orphaned task directory");
                remove_dir_quietly(&entry.path());
            }
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Fill open slots, start pending assemblies and persist changes.
    fn pump(&mut self) {
        loop {
            let dispatches = self.machine.schedule(Instant::now());
            if dispatches.is_empty() {
                break;
            }
            for dispatch in dispatches {
                if self.config.recheck_storage {
                    if let Err(err) = self.storage.check(dispatch.size) {
                        warn!(
                            task_id = %dispatch.task_id,
                            chunk_index = dispatch.index,
                            error = %err,
                            "Storage check failed before dispatch"
                        );
                        self.on_chunk_failure(&dispatch.task_id, dispatch.index, dispatch.seq, err);
                        continue;
                    }
                }
                self.spawn_worker(dispatch);
            }
        }

        for id in self.machine.ready_for_assembly() {
            if let Some(plan) = self.machine.begin_assembly(&id) {
                self.spawn_assembly(plan);
            }
        }

        self.persist_if_dirty();
    }

    fn spawn_worker(&mut self, dispatch: Dispatch) {
        let Dispatch {
            task_id,
            index,
            seq,
            locator,
            range,
            size,
            expected_digest,
            cancel,
        } = dispatch;

        debug!(
            task_id = %task_id,
            chunk_index = index,
            attempt = seq,
            bytes = size,
            "Dispatching chunk"
        );

        let request = TransferRequest {
            url: locator.url,
            range,
            expected_len: size,
            temp_path: self.layout.temp_path(&task_id, index, seq),
        };
        let transfer = Arc::clone(&self.transfer);
        let events = self.events_tx.clone();
        self.workers += 1;

        tokio::spawn(async move {
            let progress: ProgressFn = {
                let events = events.clone();
                let task_id = task_id.clone();
                Arc::new(move |bytes| {
                    let _ = events.send(WorkerEvent::ChunkProgress {
                        task_id: task_id.clone(),
                        index,
                        seq,
                        bytes,
                    });
                })
            };

            let result = run_chunk(transfer.as_ref(), request, expected_digest, progress, cancel).await;
            let _ = events.send(WorkerEvent::ChunkFinished {
                task_id,
                index,
                seq,
                result,
            });
        });
    }

    fn spawn_assembly(&mut self, plan: AssemblyPlan) {
        info!(task_id = %plan.task_id, chunks = plan.chunks.len(), "Assembling artifact");

        let layout = self.layout.clone();
        let events = self.events_tx.clone();
        let task_id = plan.task_id.clone();
        self.assemblies += 1;

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || assembly::assemble(&layout, &plan))
                .await
                .unwrap_or_else(|e| Err(DownloadError::Store(format!("assembly task failed: {}", e))));
            let _ = events.send(WorkerEvent::AssemblyFinished { task_id, result });
        });
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => {
                let _ = reply.send(self.start(request));
            }
            Command::Pause { task_id, reply } => {
                let _ = reply.send(self.pause(&task_id));
            }
            Command::Resume { task_id, reply } => {
                let _ = reply.send(self.resume(&task_id));
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(&task_id));
            }
            Command::Progress { task_id, reply } => {
                let _ = reply.send(self.progress(&task_id));
            }
            Command::List { reply } => {
                let _ = reply.send(self.machine.list());
            }
            Command::StorageInfo { reply } => {
                let _ = reply.send(self.storage.info());
            }
            Command::PauseAll { reply } => {
                let _ = reply.send(self.pause_all());
            }
            Command::WaitIdle { reply } => self.idle_waiters.push(reply),
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, request: DownloadRequest) -> DownloadResult<TaskId> {
        if self.config.require_artifact_digest && request.artifact_digest.is_none() {
            return Err(DownloadError::InvalidRequest(
                "an artifact digest is required".to_string(),
            ));
        }

        self.storage.check(request.total_size)?;

        let task = build_task(&request, self.config.chunk_size, &self.config.output_dir)?;
        task.validate()?;

        let id = task.id.clone();
        info!(
            task_id = %id,
            bytes = task.total_size,
            chunks = task.total_chunks(),
            priority = %task.priority,
            content_type = %task.content_type,
            "Created download task"
        );

        self.machine.insert(task);
        if let Err(e) = self.persist() {
            // Not durable, so not accepted
            let _ = self.machine.cancel(&id);
            return Err(e);
        }

        self.machine.set_status(&id, TaskStatus::Downloading)?;
        self.persist_if_dirty();
        Ok(id)
    }

    fn pause(&mut self, id: &TaskId) -> DownloadResult<()> {
        match self.machine.pause(id)? {
            PauseOutcome::AlreadyPaused => debug!(task_id = %id, "Task already paused"),
            PauseOutcome::Paused { detached } => {
                info!(task_id = %id, detached, "Paused task");
                self.meters.remove(id);
                self.persist_if_dirty();
            }
        }
        Ok(())
    }

    fn pause_all(&mut self) -> Vec<TaskId> {
        let mut ids = self.machine.ids_with_status(TaskStatus::Downloading);
        ids.extend(self.machine.ids_with_status(TaskStatus::Pending));
        ids.retain(|id| self.pause(id).is_ok());
        ids
    }

    fn resume(&mut self, id: &TaskId) -> DownloadResult<()> {
        match self.machine.resume(id)? {
            ResumeOutcome::AlreadyRunning => debug!(task_id = %id, "Task already downloading"),
            ResumeOutcome::Resumed { retry_round } => {
                info!(task_id = %id, retry_round, "Resumed task");
                self.persist_if_dirty();
            }
        }
        Ok(())
    }

    fn cancel(&mut self, id: &TaskId) -> DownloadResult<()> {
        let task = self.machine.cancel(id)?;
        remove_dir_quietly(&self.layout.task_dir(id));
        remove_file_quietly(&partial_path(&task.destination));
        self.persist_if_dirty();

        info!(task_id = %id, "Cancelled task");
        self.finish(id, Err(DownloadError::Cancelled));
        Ok(())
    }

    fn progress(&self, id: &TaskId) -> DownloadResult<DownloadProgress> {
        let task = self
            .machine
            .task(id)
            .ok_or_else(|| DownloadError::TaskNotFound(id.clone()))?;
        Ok(DownloadProgress::from_task(
            task,
            self.meters.get(id),
            Instant::now().into_std(),
        ))
    }

    // =========================================================================
    // Worker events
    // =========================================================================

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::ChunkProgress {
                task_id,
                index,
                seq,
                bytes,
            } => {
                if self.machine.record_progress(&task_id, index, seq, bytes) {
                    self.report_progress(&task_id, false);
                }
            }
            WorkerEvent::ChunkFinished {
                task_id,
                index,
                seq,
                result,
            } => {
                self.workers = self.workers.saturating_sub(1);
                self.on_chunk_finished(&task_id, index, seq, result);
            }
            WorkerEvent::AssemblyFinished { task_id, result } => {
                self.assemblies = self.assemblies.saturating_sub(1);
                self.on_assembly_finished(&task_id, result);
            }
        }
    }

    fn on_chunk_finished(
        &mut self,
        task_id: &TaskId,
        index: u32,
        seq: u64,
        result: DownloadResult<ChunkOutput>,
    ) {
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                self.on_chunk_failure(task_id, index, seq, err);
                return;
            }
        };

        if !self.machine.is_current(task_id, index, seq) {
            debug!(task_id = %task_id, chunk_index = index, "Discarding stale chunk result");
            self.discard_stale(task_id, &output.temp_path);
            return;
        }

        let subject = format!("chunk {} of task {}", index, task_id);
        let verification = match output.verification.into_result(subject) {
            Ok(verification) => verification,
            Err(err) => {
                remove_file_quietly(&output.temp_path);
                self.on_chunk_failure(task_id, index, seq, err);
                return;
            }
        };
        let verified = verification.is_verified();
        let digest = verification.digest().to_string();

        let chunk_path = self.layout.chunk_path(task_id, index);
        if let Err(err) = promote(&output.temp_path, &chunk_path) {
            remove_file_quietly(&output.temp_path);
            self.on_chunk_failure(task_id, index, seq, err);
            return;
        }

        match self
            .machine
            .complete_chunk(task_id, index, seq, digest, verified)
        {
            Ok(ready) => {
                debug!(
                    task_id = %task_id,
                    chunk_index = index,
                    verified,
                    ready,
                    "Chunk committed"
                );
                self.report_progress(task_id, true);
            }
            Err(e) => {
                warn!(task_id = %task_id, chunk_index = index, error = %e, "Failed to commit chunk");
                remove_file_quietly(&chunk_path);
            }
        }
    }

    fn on_chunk_failure(&mut self, task_id: &TaskId, index: u32, seq: u64, err: DownloadError) {
        match self
            .machine
            .fail_chunk(task_id, index, seq, &err, Instant::now())
        {
            FailureOutcome::Stale => {
                debug!(task_id = %task_id, chunk_index = index, error = %err, "Ignoring stale chunk failure");
                if self.machine.task(task_id).is_none() {
                    remove_dir_quietly(&self.layout.task_dir(task_id));
                }
            }
            FailureOutcome::Interrupted => {
                debug!(task_id = %task_id, chunk_index = index, "Chunk transfer interrupted");
            }
            FailureOutcome::Retry { retry_count, delay } => {
                warn!(
                    task_id = %task_id,
                    chunk_index = index,
                    attempt = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Chunk transfer failed, will retry"
                );
                self.report_progress(task_id, false);
            }
            FailureOutcome::Exhausted(failure) => {
                error!(task_id = %task_id, chunk_index = index, error = %failure, "Download task failed");
                self.persist_if_dirty();
                self.finish(task_id, Err(failure));
            }
        }
    }

    fn on_assembly_finished(&mut self, task_id: &TaskId, result: DownloadResult<StagedArtifact>) {
        match (self.machine.assembly_gate(task_id), result) {
            (AssemblyGate::Ready, Ok(staged)) => self.commit_artifact(task_id, staged),
            (AssemblyGate::Ready, Err(err)) => {
                let requeued = self
                    .machine
                    .task(task_id)
                    .cloned()
                    .map(|task| self.requeue_missing_chunks(&task))
                    .unwrap_or(0);
                if requeued > 0 {
                    warn!(task_id = %task_id, chunks = requeued, error = %err, "Assembly found damaged chunks, re-fetching");
                    self.persist_if_dirty();
                } else {
                    error!(task_id = %task_id, error = %err, "Assembly failed");
                    self.fail_task(task_id, err);
                }
            }
            (gate, Ok(staged)) => {
                debug!(task_id = %task_id, ?gate, "Discarding assembled artifact");
                remove_file_quietly(&staged.partial);
            }
            (gate, Err(err)) => {
                debug!(task_id = %task_id, ?gate, error = %err, "Ignoring assembly failure");
            }
        }
    }

    fn commit_artifact(&mut self, task_id: &TaskId, staged: StagedArtifact) {
        let StagedArtifact {
            partial,
            size,
            verification,
        } = staged;

        let (sha256, verified) = match verification {
            Verification::Mismatch { expected, actual } => {
                remove_file_quietly(&partial);
                self.reject_artifact(task_id, expected, actual);
                return;
            }
            Verification::Verified { digest } => (digest, true),
            Verification::Provisional { digest } => (digest, false),
        };

        let Some(destination) = self.machine.task(task_id).map(|t| t.destination.clone()) else {
            remove_file_quietly(&partial);
            return;
        };
        if let Err(e) = fs::rename(&partial, &destination) {
            remove_file_quietly(&partial);
            self.fail_task(task_id, DownloadError::io(&destination, e));
            return;
        }

        self.machine.complete_task(task_id);
        remove_dir_quietly(&self.layout.task_dir(task_id));
        self.persist_if_dirty();

        if !verified {
            warn!(
                task_id = %task_id,
                sha256 = %sha256,
                "Artifact delivered without a known digest"
            );
        }
        info!(
            task_id = %task_id,
            bytes = size,
            path = %destination.display(),
            "Download completed"
        );

        self.finish(
            task_id,
            Ok(CompletedArtifact {
                task_id: task_id.clone(),
                path: destination,
                size,
                sha256,
                verified,
            }),
        );
    }

    fn reject_artifact(&mut self, task_id: &TaskId, expected: String, actual: String) {
        let rejection = self
            .machine
            .reject_artifact(task_id, expected, actual, Instant::now());
        for index in &rejection.invalidated {
            remove_file_quietly(&self.layout.chunk_path(task_id, *index));
        }
        self.persist_if_dirty();

        match rejection.failure {
            Some(failure) => {
                error!(task_id = %task_id, error = %failure, "Artifact failed verification");
                self.finish(task_id, Err(failure));
            }
            None => warn!(
                task_id = %task_id,
                chunks = rejection.invalidated.len(),
                "Artifact digest mismatch, re-fetching unverified chunks"
            ),
        }
    }

    fn fail_task(&mut self, task_id: &TaskId, err: DownloadError) {
        self.machine.fail_task(task_id, err.to_string());
        self.persist_if_dirty();
        self.finish(task_id, Err(err));
    }

    // =========================================================================
    // Notifications and persistence
    // =========================================================================

    fn finish(&mut self, task_id: &TaskId, outcome: Result<CompletedArtifact, DownloadError>) {
        self.meters.remove(task_id);
        self.last_progress.remove(task_id);
        self.listener.on_complete(task_id, outcome);
    }

    /// Sample throughput and notify the listener, throttled per task.
    fn report_progress(&mut self, task_id: &TaskId, force: bool) {
        let Some(task) = self.machine.task(task_id) else {
            return;
        };
        let now = Instant::now();
        let bytes = task.downloaded_bytes();
        let meter = self
            .meters
            .entry(task_id.clone())
            .or_insert_with(|| ThroughputMeter::new(DEFAULT_SPEED_WINDOW, bytes, now.into_std()));
        meter.record_at(bytes, now.into_std());

        if !force {
            let throttled = self
                .last_progress
                .get(task_id)
                .is_some_and(|last| now.duration_since(*last) < self.config.progress_interval);
            if throttled {
                return;
            }
        }
        self.last_progress.insert(task_id.clone(), now);

        let progress = DownloadProgress::from_task(task, Some(meter), now.into_std());
        self.listener.on_progress(task_id, &progress);
    }

    fn notify_idle(&mut self) {
        if self.idle_waiters.is_empty() || !self.is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// No transfers, assemblies or downloading tasks remain.
    fn is_idle(&self) -> bool {
        self.workers == 0
            && self.assemblies == 0
            && self
                .machine
                .ids_with_status(TaskStatus::Downloading)
                .is_empty()
    }

    fn persist(&mut self) -> DownloadResult<()> {
        self.machine.take_dirty();
        self.store.persist(&self.machine.list())
    }

    fn persist_if_dirty(&mut self) {
        if self.machine.take_dirty() {
            if let Err(e) = self.store.persist(&self.machine.list()) {
                error!(error = %e, "Failed to persist download tasks");
            }
        }
    }

    fn discard_stale(&self, task_id: &TaskId, temp_path: &Path) {
        remove_file_quietly(temp_path);
        if self.machine.task(task_id).is_none() {
            remove_dir_quietly(&self.layout.task_dir(task_id));
        }
    }
}

/// Transfer one chunk, check its length and digest it off the engine loop.
async fn run_chunk(
    transfer: &dyn ChunkTransfer,
    request: TransferRequest,
    expected_digest: Option<String>,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> DownloadResult<ChunkOutput> {
    let expected_len = request.expected_len;
    let receipt = transfer.fetch(request, progress, cancel).await?;

    let on_disk = match tokio::fs::metadata(&receipt.path).await {
        Ok(meta) => meta.len(),
        Err(e) => return Err(DownloadError::io(&receipt.path, e)),
    };
    if receipt.bytes != expected_len || on_disk != expected_len {
        remove_file_quietly(&receipt.path);
        return Err(TransferError::LengthMismatch {
            expected: expected_len,
            actual: on_disk,
        }
        .into());
    }

    match verify_chunk_blocking(receipt.path.clone(), expected_digest).await {
        Ok(verification) => Ok(ChunkOutput {
            temp_path: receipt.path,
            verification,
        }),
        Err(e) => {
            remove_file_quietly(&receipt.path);
            Err(e)
        }
    }
}

/// Move a verified temp file into the chunk area.
fn promote(temp_path: &Path, chunk_path: &Path) -> DownloadResult<()> {
    if let Some(parent) = chunk_path.parent() {
        fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
    }
    fs::rename(temp_path, chunk_path).map_err(|e| DownloadError::io(chunk_path, e))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

fn remove_dir_quietly(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove directory");
        }
    }
}
