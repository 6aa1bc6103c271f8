//! Registry state machine.
//!
//! Owns every task record and the bookkeeping around it: which chunk
//! transfers are in flight, when failed chunks become eligible again and
//! which tasks are being assembled. It performs no I/O; the engine feeds it
//! commands and worker events and carries out the side effects it asks for.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::policy::RetryPolicy;
use crate::error::{DownloadError, DownloadResult};
use crate::model::{
    ChunkLocator, ChunkSource, ChunkStatus, DownloadChunk, DownloadRequest, DownloadTask, TaskId,
    TaskStatus,
};
use crate::planner;

type ChunkKey = (TaskId, u32);

#[derive(Debug)]
struct InFlight {
    seq: u64,
    cancel: CancellationToken,
}

/// A chunk transfer the engine should start.
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub task_id: TaskId,
    pub index: u32,
    /// Unique per dispatch; stale results carry an old sequence number.
    pub seq: u64,
    pub locator: ChunkLocator,
    pub range: Option<(u64, u64)>,
    pub size: u64,
    pub expected_digest: Option<String>,
    pub cancel: CancellationToken,
}

/// What a chunk failure led to.
#[derive(Debug)]
pub(crate) enum FailureOutcome {
    /// The result belonged to a detached transfer.
    Stale,
    /// The transfer was cancelled; no budget consumed.
    Interrupted,
    /// Budget left; eligible again after `delay`.
    Retry { retry_count: u32, delay: Duration },
    /// Budget exhausted; the task has failed.
    Exhausted(DownloadError),
}

/// Result of `pause`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PauseOutcome {
    AlreadyPaused,
    Paused { detached: usize },
}

/// Result of `resume`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ResumeOutcome {
    AlreadyRunning,
    Resumed { retry_round: bool },
}

/// Whether a finished assembly may be committed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AssemblyGate {
    /// Task was cancelled meanwhile.
    Gone,
    /// Task is no longer downloading (paused); reassemble on resume.
    Deferred,
    Ready,
}

/// Inputs for assembling a fully transferred task.
#[derive(Debug, Clone)]
pub(crate) struct AssemblyPlan {
    pub task_id: TaskId,
    /// `(index, size)` in index order.
    pub chunks: Vec<(u32, u64)>,
    pub destination: PathBuf,
    pub expected_digest: Option<String>,
}

/// Consequence of an assembled artifact failing its digest.
#[derive(Debug)]
pub(crate) struct ArtifactRejection {
    /// Provisional chunks whose committed files must be discarded.
    pub invalidated: Vec<u32>,
    /// Set when the task failed as a result.
    pub failure: Option<DownloadError>,
}

/// Build a task record (status `pending`) from a request.
pub(crate) fn build_task(
    request: &DownloadRequest,
    default_chunk_size: u64,
    output_dir: &Path,
) -> DownloadResult<DownloadTask> {
    let chunk_size = request.chunk_size.unwrap_or(default_chunk_size);
    let spans = planner::plan(request.total_size, chunk_size)?;

    if let ChunkSource::PerChunk { urls } = &request.source {
        if urls.len() != spans.len() {
            return Err(DownloadError::InvalidRequest(format!(
                "{} chunk URLs supplied for {} planned chunks",
                urls.len(),
                spans.len()
            )));
        }
    }
    if let Some(digests) = &request.chunk_digests {
        if digests.len() != spans.len() {
            return Err(DownloadError::InvalidRequest(format!(
                "{} chunk digests supplied for {} planned chunks",
                digests.len(),
                spans.len()
            )));
        }
    }

    let id = TaskId::generate();
    let chunks = spans
        .iter()
        .map(|span| {
            let locator = match &request.source {
                ChunkSource::Ranged { url } => ChunkLocator::ranged(url.clone()),
                ChunkSource::PerChunk { urls } => ChunkLocator::whole(urls[span.index as usize].clone()),
            };
            let digest = request
                .chunk_digests
                .as_ref()
                .map(|d| d[span.index as usize].clone());
            DownloadChunk::new(&id, span.index, span.offset, span.size, locator, digest)
        })
        .collect();

    let destination = request
        .destination
        .clone()
        .unwrap_or_else(|| output_dir.join(format!("{}.bin", id)));
    let now = Utc::now();

    Ok(DownloadTask {
        id,
        content_type: request.content_type,
        priority: request.priority,
        total_size: request.total_size,
        chunk_size,
        chunks,
        status: TaskStatus::Pending,
        destination,
        artifact_digest: request.artifact_digest.clone(),
        label: request.label.clone(),
        retry_rounds: 0,
        created_at: now,
        updated_at: now,
        completed_at: None,
        error: None,
    })
}

/// The task registry and its scheduling state.
#[derive(Debug)]
pub(crate) struct Machine {
    tasks: HashMap<TaskId, DownloadTask>,
    retry: RetryPolicy,
    max_concurrent: usize,
    in_flight: HashMap<ChunkKey, InFlight>,
    not_before: HashMap<ChunkKey, Instant>,
    assembling: HashSet<TaskId>,
    next_seq: u64,
    dirty: bool,
}

impl Machine {
    pub fn new(retry: RetryPolicy, max_concurrent: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            retry,
            max_concurrent: max_concurrent.max(1),
            in_flight: HashMap::new(),
            not_before: HashMap::new(),
            assembling: HashSet::new(),
            next_seq: 0,
            dirty: false,
        }
    }

    /// Adopt tasks read from the store after a (re)start.
    ///
    /// `pending` tasks become `downloading`; chunks caught mid-transfer go
    /// back to `pending` without consuming budget.
    pub fn load(&mut self, tasks: Vec<DownloadTask>) {
        for mut task in tasks {
            if task.status == TaskStatus::Pending {
                task.set_status(TaskStatus::Downloading);
                self.dirty = true;
            }
            let interrupted = task.interrupt_transfers();
            if interrupted > 0 {
                debug!(task_id = %task.id, interrupted, "Reset interrupted chunks");
                self.dirty = true;
            }
            self.tasks.insert(task.id.clone(), task);
        }
    }

    /// Add a newly created task.
    pub fn insert(&mut self, task: DownloadTask) {
        self.tasks.insert(task.id.clone(), task);
        self.dirty = true;
    }

    pub fn task(&self, id: &TaskId) -> Option<&DownloadTask> {
        self.tasks.get(id)
    }

    /// Every task, ordered by priority (highest first) then creation time.
    pub fn list(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (Reverse(t.priority), t.created_at, t.id.clone()));
        tasks
    }

    /// Ids of tasks in `status`.
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Whether state changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    #[cfg(test)]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Transition a task's status directly (start path).
    pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) -> DownloadResult<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| DownloadError::TaskNotFound(id.clone()))?;
        task.set_status(status);
        self.dirty = true;
        Ok(())
    }

    /// Return a committed chunk whose file is missing to `pending`.
    pub fn requeue_chunk(&mut self, id: &TaskId, index: u32) {
        if let Some(chunk) = self.tasks.get_mut(id).and_then(|t| t.chunk_mut(index)) {
            chunk.reset();
            self.dirty = true;
        }
    }

    pub fn pause(&mut self, id: &TaskId) -> DownloadResult<PauseOutcome> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| DownloadError::TaskNotFound(id.clone()))?;

        match task.status {
            TaskStatus::Paused => Ok(PauseOutcome::AlreadyPaused),
            TaskStatus::Pending | TaskStatus::Downloading => {
                let detached = self.detach_task(id);
                if let Some(task) = self.tasks.get_mut(id) {
                    task.set_status(TaskStatus::Paused);
                }
                self.dirty = true;
                Ok(PauseOutcome::Paused { detached })
            }
            status => Err(DownloadError::InvalidState {
                task_id: id.clone(),
                status,
                operation: "pause",
            }),
        }
    }

    pub fn resume(&mut self, id: &TaskId) -> DownloadResult<ResumeOutcome> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| DownloadError::TaskNotFound(id.clone()))?;

        let retry_round = match task.status {
            TaskStatus::Downloading => return Ok(ResumeOutcome::AlreadyRunning),
            TaskStatus::Paused | TaskStatus::Pending => false,
            TaskStatus::Failed => {
                task.retry_rounds += 1;
                task.error = None;
                true
            }
            status => {
                return Err(DownloadError::InvalidState {
                    task_id: id.clone(),
                    status,
                    operation: "resume",
                })
            }
        };

        task.set_status(TaskStatus::Downloading);
        self.not_before.retain(|(task_id, _), _| task_id != id);
        self.dirty = true;
        Ok(ResumeOutcome::Resumed { retry_round })
    }

    /// Remove a task, detaching its transfers. Returns the removed record.
    pub fn cancel(&mut self, id: &TaskId) -> DownloadResult<DownloadTask> {
        if !self.tasks.contains_key(id) {
            return Err(DownloadError::TaskNotFound(id.clone()));
        }
        self.detach_task(id);
        self.not_before.retain(|(task_id, _), _| task_id != id);
        self.assembling.remove(id);
        self.dirty = true;
        self.tasks
            .remove(id)
            .ok_or_else(|| DownloadError::TaskNotFound(id.clone()))
    }

    /// Detach every transfer (shutdown). Chunks go back to `pending`.
    pub fn detach_all(&mut self) -> usize {
        let ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        ids.iter().map(|id| self.detach_task(id)).sum()
    }

    /// Select eligible chunks for the open slots and mark them in flight.
    ///
    /// Order: task priority (highest first), task creation time, chunk index.
    pub fn schedule(&mut self, now: Instant) -> Vec<Dispatch> {
        let mut free = self.max_concurrent.saturating_sub(self.in_flight.len());
        if free == 0 {
            return Vec::new();
        }

        let mut order: Vec<(Reverse<_>, _, TaskId)> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Downloading && !self.assembling.contains(&t.id))
            .map(|t| (Reverse(t.priority), t.created_at, t.id.clone()))
            .collect();
        order.sort();

        let mut dispatches = Vec::new();
        for (_, _, id) in order {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            let ceiling = task.chunk_ceiling(self.retry.attempts_per_round());

            for chunk in task.chunks.iter_mut() {
                if free == 0 {
                    break;
                }
                let key = (id.clone(), chunk.index);
                if !chunk.has_budget(ceiling) || self.in_flight.contains_key(&key) {
                    continue;
                }
                if self.not_before.get(&key).is_some_and(|at| *at > now) {
                    continue;
                }
                if chunk.begin().is_err() {
                    continue;
                }

                self.next_seq += 1;
                let cancel = CancellationToken::new();
                self.in_flight.insert(
                    key.clone(),
                    InFlight {
                        seq: self.next_seq,
                        cancel: cancel.clone(),
                    },
                );
                self.not_before.remove(&key);

                dispatches.push(Dispatch {
                    task_id: id.clone(),
                    index: chunk.index,
                    seq: self.next_seq,
                    locator: chunk.locator.clone(),
                    range: chunk.locator.ranged.then(|| chunk.byte_range()),
                    size: chunk.size,
                    expected_digest: chunk.expected_digest.clone(),
                    cancel,
                });
                free -= 1;
            }
            if free == 0 {
                break;
            }
        }

        if !dispatches.is_empty() {
            self.dirty = true;
        }
        dispatches
    }

    /// Earliest backoff deadline that could fill an open slot.
    pub fn next_wakeup(&self) -> Option<Instant> {
        if self.in_flight.len() >= self.max_concurrent {
            return None;
        }
        self.not_before
            .iter()
            .filter(|((id, index), _)| {
                self.tasks.get(id).is_some_and(|t| {
                    t.status == TaskStatus::Downloading
                        && !self.assembling.contains(id)
                        && t.chunk(*index)
                            .is_some_and(|c| c.has_budget(t.chunk_ceiling(self.retry.attempts_per_round())))
                })
            })
            .map(|(_, at)| *at)
            .min()
    }

    /// Whether a worker result is for the current transfer of a live task.
    pub fn is_current(&self, id: &TaskId, index: u32, seq: u64) -> bool {
        let live = self
            .tasks
            .get(id)
            .is_some_and(|t| t.status.accepts_results());
        live && self
            .in_flight
            .get(&(id.clone(), index))
            .is_some_and(|f| f.seq == seq)
    }

    /// Apply in-flight byte progress. Returns false for stale reports.
    pub fn record_progress(&mut self, id: &TaskId, index: u32, seq: u64, bytes: u64) -> bool {
        if !self.is_current(id, index, seq) {
            return false;
        }
        match self.tasks.get_mut(id).and_then(|t| t.chunk_mut(index)) {
            Some(chunk) => {
                chunk.record_progress(bytes);
                true
            }
            None => false,
        }
    }

    /// Commit a verified (or provisional) chunk.
    ///
    /// Returns true when the task is now fully transferred and downloading.
    pub fn complete_chunk(
        &mut self,
        id: &TaskId,
        index: u32,
        seq: u64,
        digest: String,
        verified: bool,
    ) -> DownloadResult<bool> {
        if !self.is_current(id, index, seq) {
            return Err(DownloadError::InvalidRequest(format!(
                "stale result for chunk {} of task {}",
                index, id
            )));
        }
        self.in_flight.remove(&(id.clone(), index));

        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| DownloadError::TaskNotFound(id.clone()))?;
        let chunk = task
            .chunk_mut(index)
            .ok_or_else(|| DownloadError::InvalidRequest(format!("no chunk {}", index)))?;
        chunk.complete(digest, verified)?;
        task.touch();
        self.dirty = true;

        Ok(task.status == TaskStatus::Downloading && task.is_fully_transferred())
    }

    /// Record a failed chunk attempt and decide what happens next.
    pub fn fail_chunk(
        &mut self,
        id: &TaskId,
        index: u32,
        seq: u64,
        error: &DownloadError,
        now: Instant,
    ) -> FailureOutcome {
        if !self.is_current(id, index, seq) {
            return FailureOutcome::Stale;
        }
        let key = (id.clone(), index);
        self.in_flight.remove(&key);
        self.dirty = true;

        let per_round = self.retry.attempts_per_round();
        let Some(task) = self.tasks.get_mut(id) else {
            return FailureOutcome::Stale;
        };
        let ceiling = task.chunk_ceiling(per_round);
        let round_floor = per_round.saturating_mul(task.retry_rounds);
        let paused = task.status == TaskStatus::Paused;
        let Some(chunk) = task.chunk_mut(index) else {
            return FailureOutcome::Stale;
        };

        if paused || matches!(error, DownloadError::Cancelled) || is_cancelled_transfer(error) {
            chunk.interrupt();
            return FailureOutcome::Interrupted;
        }

        let retry_count = match chunk.fail(error.to_string()) {
            Ok(count) => count,
            Err(e) => {
                warn!(task_id = %id, chunk_index = index, error = %e, "Unexpected chunk state");
                return FailureOutcome::Stale;
            }
        };

        if retry_count >= ceiling {
            let failure = DownloadError::RetriesExhausted {
                task_id: id.clone(),
                chunk_index: index,
                attempts: retry_count,
                last_error: error.to_string(),
            };
            self.fail_task(id, failure.to_string());
            return FailureOutcome::Exhausted(failure);
        }

        let delay = self
            .retry
            .backoff(retry_count.saturating_sub(round_floor).max(1));
        self.not_before.insert(key, now + delay);
        FailureOutcome::Retry { retry_count, delay }
    }

    /// Mark a task failed and detach its remaining transfers.
    pub fn fail_task(&mut self, id: &TaskId, error: String) {
        self.detach_task(id);
        self.assembling.remove(id);
        self.not_before.retain(|(task_id, _), _| task_id != id);
        if let Some(task) = self.tasks.get_mut(id) {
            task.error = Some(error);
            task.set_status(TaskStatus::Failed);
            self.dirty = true;
        }
    }

    /// Tasks whose chunks are all committed and that are waiting for assembly.
    pub fn ready_for_assembly(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Downloading
                    && t.is_fully_transferred()
                    && !self.assembling.contains(&t.id)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// Claim a task for assembly.
    pub fn begin_assembly(&mut self, id: &TaskId) -> Option<AssemblyPlan> {
        let task = self.tasks.get(id)?;
        if task.status != TaskStatus::Downloading
            || !task.is_fully_transferred()
            || self.assembling.contains(id)
        {
            return None;
        }
        self.assembling.insert(id.clone());
        Some(AssemblyPlan {
            task_id: id.clone(),
            chunks: task.chunks.iter().map(|c| (c.index, c.size)).collect(),
            destination: task.destination.clone(),
            expected_digest: task.artifact_digest.clone(),
        })
    }

    /// Release the assembly claim and report whether the result may be used.
    pub fn assembly_gate(&mut self, id: &TaskId) -> AssemblyGate {
        let claimed = self.assembling.remove(id);
        match self.tasks.get(id) {
            None => AssemblyGate::Gone,
            Some(t) if !claimed || t.status != TaskStatus::Downloading => AssemblyGate::Deferred,
            Some(_) => AssemblyGate::Ready,
        }
    }

    /// Mark a task completed and remove it from the registry.
    pub fn complete_task(&mut self, id: &TaskId) -> Option<DownloadTask> {
        self.not_before.retain(|(task_id, _), _| task_id != id);
        self.assembling.remove(id);
        let mut task = self.tasks.remove(id)?;
        task.set_status(TaskStatus::Completed);
        self.dirty = true;
        Some(task)
    }

    /// Handle an assembled artifact whose digest did not match.
    ///
    /// Provisionally accepted chunks are suspects: they are invalidated and
    /// re-queued, consuming budget. If every chunk was verified the manifest
    /// itself is inconsistent and the task fails.
    pub fn reject_artifact(
        &mut self,
        id: &TaskId,
        expected: String,
        actual: String,
        now: Instant,
    ) -> ArtifactRejection {
        let per_round = self.retry.attempts_per_round();
        let Some(task) = self.tasks.get_mut(id) else {
            return ArtifactRejection {
                invalidated: Vec::new(),
                failure: None,
            };
        };
        let ceiling = task.chunk_ceiling(per_round);
        let round_floor = per_round.saturating_mul(task.retry_rounds);
        let reason = format!("assembled artifact digest {} does not match {}", actual, expected);

        let mut invalidated = Vec::new();
        let mut exhausted = None;
        for chunk in task
            .chunks
            .iter_mut()
            .filter(|c| c.status == ChunkStatus::Completed && !c.verified)
        {
            let Ok(retry_count) = chunk.invalidate(reason.clone()) else {
                continue;
            };
            invalidated.push(chunk.index);
            if retry_count >= ceiling && exhausted.is_none() {
                exhausted = Some(DownloadError::RetriesExhausted {
                    task_id: id.clone(),
                    chunk_index: chunk.index,
                    attempts: retry_count,
                    last_error: reason.clone(),
                });
            }
            let delay = self
                .retry
                .backoff(retry_count.saturating_sub(round_floor).max(1));
            self.not_before.insert((id.clone(), chunk.index), now + delay);
        }
        task.touch();
        self.dirty = true;

        let failure = if invalidated.is_empty() {
            Some(DownloadError::IntegrityMismatch {
                subject: format!("artifact of task {}", id),
                expected,
                actual,
            })
        } else {
            exhausted
        };

        if let Some(err) = &failure {
            self.fail_task(id, err.to_string());
        }

        ArtifactRejection {
            invalidated,
            failure,
        }
    }

    /// Cancel and forget every in-flight transfer of a task.
    fn detach_task(&mut self, id: &TaskId) -> usize {
        let keys: Vec<ChunkKey> = self
            .in_flight
            .keys()
            .filter(|(task_id, _)| task_id == id)
            .cloned()
            .collect();

        for key in &keys {
            if let Some(flight) = self.in_flight.remove(key) {
                flight.cancel.cancel();
            }
        }
        if let Some(task) = self.tasks.get_mut(id) {
            task.interrupt_transfers();
        }
        keys.len()
    }
}

fn is_cancelled_transfer(error: &DownloadError) -> bool {
    matches!(
        error,
        DownloadError::Transfer(crate::transfer::TransferError::Cancelled)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, Priority};
    use crate::transfer::TransferError;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
    }

    fn machine(slots: usize) -> Machine {
        Machine::new(policy(), slots)
    }

    fn add(machine: &mut Machine, request: DownloadRequest) -> TaskId {
        let mut task = build_task(&request, 100, Path::new("/out")).unwrap();
        task.status = TaskStatus::Downloading;
        let id = task.id.clone();
        machine.insert(task);
        id
    }

    fn timeout() -> DownloadError {
        DownloadError::Transfer(TransferError::Timeout)
    }

    #[test]
    fn test_build_task_plans_chunks() {
        let request = DownloadRequest::ranged("http://a/x", 250).with_chunk_size(100);
        let task = build_task(&request, 4096, Path::new("/out")).unwrap();

        let sizes: Vec<u64> = task.chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.destination, Path::new("/out").join(format!("{}.bin", task.id)));
        assert!(task.chunks.iter().all(|c| c.locator.ranged));
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_build_task_rejects_mismatched_lists() {
        let request = DownloadRequest::per_chunk(vec!["http://a/0".into()], 100, 250);
        assert!(matches!(
            build_task(&request, 100, Path::new("/out")),
            Err(DownloadError::InvalidRequest(_))
        ));

        let request = DownloadRequest::ranged("http://a/x", 250)
            .with_chunk_size(100)
            .with_chunk_digests(vec!["a".into()]);
        assert!(build_task(&request, 100, Path::new("/out")).is_err());
    }

    #[test]
    fn test_schedule_respects_concurrency() {
        let mut m = machine(2);
        add(&mut m, DownloadRequest::ranged("http://a", 500));

        let first = m.schedule(Instant::now());
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].index, 0);
        assert_eq!(first[1].index, 1);
        assert_eq!(first[0].range, Some((0, 99)));
        assert!(m.schedule(Instant::now()).is_empty());
    }

    #[test]
    fn test_schedule_orders_by_priority() {
        let mut m = machine(1);
        let low = add(
            &mut m,
            DownloadRequest::ranged("http://low", 100).with_priority(Priority::Low),
        );
        let critical = add(
            &mut m,
            DownloadRequest::ranged("http://core", 100)
                .with_priority(Priority::Critical)
                .with_content_type(ContentType::EssentialBundle),
        );

        let dispatch = m.schedule(Instant::now());
        assert_eq!(dispatch.len(), 1);
        assert_eq!(dispatch[0].task_id, critical);

        m.complete_chunk(&critical, 0, dispatch[0].seq, "d".into(), false)
            .unwrap();
        let next = m.schedule(Instant::now());
        assert_eq!(next[0].task_id, low);
    }

    #[test]
    fn test_complete_chunk_reports_full_transfer() {
        let mut m = machine(4);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 150));

        let d = m.schedule(Instant::now());
        assert!(!m.complete_chunk(&id, 0, d[0].seq, "a".into(), true).unwrap());
        assert!(m.complete_chunk(&id, 1, d[1].seq, "b".into(), true).unwrap());
        assert_eq!(m.ready_for_assembly(), vec![id]);
    }

    #[test]
    fn test_failure_backoff_then_retry() {
        let mut m = machine(1);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 100));
        let now = Instant::now();

        let d = m.schedule(now);
        match m.fail_chunk(&id, 0, d[0].seq, &timeout(), now) {
            FailureOutcome::Retry { retry_count, delay } => {
                assert_eq!(retry_count, 1);
                assert_eq!(delay, Duration::from_millis(100));
            }
            other => panic!("Expected Retry, got {:?}", other),
        }

        // Not eligible until the backoff elapses
        assert!(m.schedule(now).is_empty());
        assert_eq!(m.next_wakeup(), Some(now + Duration::from_millis(100)));

        let later = now + Duration::from_millis(100);
        let retry = m.schedule(later);
        assert_eq!(retry.len(), 1);
        assert!(retry[0].seq > d[0].seq);
    }

    #[test]
    fn test_retry_ceiling_fails_task() {
        let mut m = machine(1);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 100));
        let mut now = Instant::now();

        for attempt in 1..=3 {
            let d = m.schedule(now);
            assert_eq!(d.len(), 1, "attempt {}", attempt);
            let outcome = m.fail_chunk(&id, 0, d[0].seq, &timeout(), now);
            if attempt < 3 {
                assert!(matches!(outcome, FailureOutcome::Retry { .. }));
            } else {
                match outcome {
                    FailureOutcome::Exhausted(DownloadError::RetriesExhausted {
                        attempts, ..
                    }) => assert_eq!(attempts, 3),
                    other => panic!("Expected Exhausted, got {:?}", other),
                }
            }
            now += Duration::from_secs(5);
        }

        assert_eq!(m.task(&id).unwrap().status, TaskStatus::Failed);
        assert!(m.schedule(now).is_empty());
        assert_eq!(m.next_wakeup(), None);
    }

    #[test]
    fn test_exhaustion_detaches_siblings() {
        let mut m = machine(2);
        let id = add(
            &mut m,
            DownloadRequest::ranged("http://a", 200).with_chunk_size(100),
        );
        let m_policy = RetryPolicy::none();
        m.retry = m_policy;

        let d = m.schedule(Instant::now());
        let sibling_cancel = d[1].cancel.clone();
        let outcome = m.fail_chunk(&id, 0, d[0].seq, &timeout(), Instant::now());

        assert!(matches!(outcome, FailureOutcome::Exhausted(_)));
        assert!(sibling_cancel.is_cancelled());
        assert_eq!(m.in_flight_count(), 0);
        // Late result from the sibling is stale
        assert!(!m.is_current(&id, 1, d[1].seq));
    }

    #[test]
    fn test_cancelled_transfer_is_free() {
        let mut m = machine(1);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 100));
        let d = m.schedule(Instant::now());

        let outcome = m.fail_chunk(
            &id,
            0,
            d[0].seq,
            &DownloadError::Transfer(TransferError::Cancelled),
            Instant::now(),
        );
        assert!(matches!(outcome, FailureOutcome::Interrupted));
        assert_eq!(m.task(&id).unwrap().chunks[0].retry_count, 0);
    }

    #[test]
    fn test_pause_is_idempotent_and_detaches() {
        let mut m = machine(2);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 300));
        let d = m.schedule(Instant::now());

        assert_eq!(m.pause(&id).unwrap(), PauseOutcome::Paused { detached: 2 });
        assert!(d.iter().all(|d| d.cancel.is_cancelled()));
        assert_eq!(m.pause(&id).unwrap(), PauseOutcome::AlreadyPaused);

        let task = m.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert!(task.chunks.iter().all(|c| c.status == ChunkStatus::Pending));
        assert!(m.schedule(Instant::now()).is_empty());
    }

    #[test]
    fn test_resume_is_noop_when_downloading() {
        let mut m = machine(2);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 300));
        assert_eq!(m.resume(&id).unwrap(), ResumeOutcome::AlreadyRunning);

        m.pause(&id).unwrap();
        assert_eq!(
            m.resume(&id).unwrap(),
            ResumeOutcome::Resumed { retry_round: false }
        );
        assert_eq!(m.schedule(Instant::now()).len(), 2);
    }

    #[test]
    fn test_resume_failed_starts_retry_round() {
        let mut m = machine(1);
        m.retry = RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(10));
        let id = add(&mut m, DownloadRequest::ranged("http://a", 100));

        let d = m.schedule(Instant::now());
        assert!(matches!(
            m.fail_chunk(&id, 0, d[0].seq, &timeout(), Instant::now()),
            FailureOutcome::Exhausted(_)
        ));

        assert_eq!(
            m.resume(&id).unwrap(),
            ResumeOutcome::Resumed { retry_round: true }
        );
        let task = m.task(&id).unwrap();
        assert_eq!(task.retry_rounds, 1);
        assert!(task.error.is_none());

        let again = m.schedule(Instant::now());
        assert_eq!(again.len(), 1);
        assert_eq!(m.task(&id).unwrap().chunks[0].retry_count, 1);
    }

    #[test]
    fn test_zero_retry_policy_resume_gets_one_attempt() {
        let mut m = machine(1);
        m.retry = RetryPolicy::none();
        let id = add(&mut m, DownloadRequest::ranged("http://a", 100));

        let d = m.schedule(Instant::now());
        assert!(matches!(
            m.fail_chunk(&id, 0, d[0].seq, &timeout(), Instant::now()),
            FailureOutcome::Exhausted(_)
        ));
        assert_eq!(
            m.resume(&id).unwrap(),
            ResumeOutcome::Resumed { retry_round: true }
        );

        let later = Instant::now() + Duration::from_secs(3600);
        let again = m.schedule(later);
        assert_eq!(again.len(), 1);

        assert!(matches!(
            m.fail_chunk(&id, 0, again[0].seq, &timeout(), later),
            FailureOutcome::Exhausted(_)
        ));
        assert_eq!(m.task(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn test_cancel_removes_record() {
        let mut m = machine(2);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 300));
        let d = m.schedule(Instant::now());

        let removed = m.cancel(&id).unwrap();
        assert_eq!(removed.id, id);
        assert!(m.task(&id).is_none());
        assert!(d[0].cancel.is_cancelled());
        assert!(!m.is_current(&id, 0, d[0].seq));
        assert!(matches!(m.cancel(&id), Err(DownloadError::TaskNotFound(_))));
    }

    #[test]
    fn test_assembly_gate() {
        let mut m = machine(2);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 100));
        let d = m.schedule(Instant::now());
        m.complete_chunk(&id, 0, d[0].seq, "x".into(), false).unwrap();

        let plan = m.begin_assembly(&id).unwrap();
        assert_eq!(plan.chunks, vec![(0, 100)]);
        assert!(m.begin_assembly(&id).is_none());

        m.pause(&id).unwrap();
        assert_eq!(m.assembly_gate(&id), AssemblyGate::Deferred);

        m.resume(&id).unwrap();
        assert_eq!(m.ready_for_assembly(), vec![id.clone()]);
        m.begin_assembly(&id).unwrap();
        assert_eq!(m.assembly_gate(&id), AssemblyGate::Ready);

        let done = m.complete_task(&id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(m.assembly_gate(&id), AssemblyGate::Gone);
    }

    #[test]
    fn test_reject_artifact_requeues_provisional_chunks() {
        let mut m = machine(2);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 200));
        let d = m.schedule(Instant::now());
        m.complete_chunk(&id, 0, d[0].seq, "a".into(), true).unwrap();
        m.complete_chunk(&id, 1, d[1].seq, "b".into(), false).unwrap();

        let rejection = m.reject_artifact(&id, "want".into(), "got".into(), Instant::now());
        assert_eq!(rejection.invalidated, vec![1]);
        assert!(rejection.failure.is_none());

        let task = m.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Downloading);
        assert_eq!(task.chunks[0].status, ChunkStatus::Completed);
        assert_eq!(task.chunks[1].status, ChunkStatus::Failed);
        assert_eq!(task.chunks[1].retry_count, 1);
    }

    #[test]
    fn test_reject_artifact_with_all_verified_fails() {
        let mut m = machine(2);
        let id = add(&mut m, DownloadRequest::ranged("http://a", 100));
        let d = m.schedule(Instant::now());
        m.complete_chunk(&id, 0, d[0].seq, "a".into(), true).unwrap();

        let rejection = m.reject_artifact(&id, "want".into(), "got".into(), Instant::now());
        assert!(rejection.invalidated.is_empty());
        assert!(matches!(
            rejection.failure,
            Some(DownloadError::IntegrityMismatch { .. })
        ));
        assert_eq!(m.task(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn test_load_resets_interrupted_chunks() {
        let mut task = build_task(&DownloadRequest::ranged("http://a", 200), 100, Path::new("/o")).unwrap();
        task.status = TaskStatus::Downloading;
        task.chunks[0].begin().unwrap();
        task.chunks[0].complete("a".into(), true).unwrap();
        task.chunks[1].begin().unwrap();
        let id = task.id.clone();

        let mut pending = build_task(&DownloadRequest::ranged("http://b", 100), 100, Path::new("/o")).unwrap();
        pending.status = TaskStatus::Pending;
        let pending_id = pending.id.clone();

        let mut m = machine(4);
        m.load(vec![task, pending]);
        assert!(m.take_dirty());

        let loaded = m.task(&id).unwrap();
        assert_eq!(loaded.chunks[0].status, ChunkStatus::Completed);
        assert_eq!(loaded.chunks[1].status, ChunkStatus::Pending);
        assert_eq!(m.task(&pending_id).unwrap().status, TaskStatus::Downloading);

        // Only the unfinished chunks are scheduled
        let d = m.schedule(Instant::now());
        assert_eq!(d.len(), 2);
        assert!(d.iter().all(|d| !(d.task_id == id && d.index == 0)));
    }
}
