//! Shared fakes for the orchestrator integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use bundlefetch::error::{DownloadError, DownloadResult};
use bundlefetch::orchestrator::{
    ChannelListener, CompletedArtifact, DownloadEvent, DownloadOrchestrator, RetryPolicy,
};
use bundlefetch::storage::{admit, StorageAdvisor, StorageInfo};
use bundlefetch::store::TaskStore;
use bundlefetch::transfer::{
    BoxFuture, ChunkTransfer, ProgressFn, TransferError, TransferReceipt, TransferRequest,
};
use bundlefetch::{DownloadConfig, TaskId};

pub const GB: u64 = 1024 * 1024 * 1024;
pub const MB: u64 = 1024 * 1024;

// ============================================================================
// Scripted transfer
// ============================================================================

/// What the next fetch of a chunk does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Fail with HTTP 503.
    Fail,
    /// Deliver the right length with a flipped first byte.
    Corrupt,
    /// Block until cancelled.
    Hang,
    /// Block until notified (or cancelled), then deliver.
    Hold(Arc<Notify>),
}

/// In-memory transfer serving fixed bodies, with per-chunk scripted faults.
///
/// Chunks are keyed by `(url, range start)`; whole-resource fetches use 0.
#[derive(Debug, Default)]
pub struct ScriptedTransfer {
    bodies: HashMap<String, Vec<u8>>,
    script: Mutex<HashMap<(String, u64), VecDeque<Step>>>,
    fetches: Mutex<Vec<(String, u64)>>,
}

impl ScriptedTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(mut self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(url.to_string(), body);
        self
    }

    pub fn script(&self, url: &str, offset: u64, steps: Vec<Step>) {
        self.script
            .lock()
            .entry((url.to_string(), offset))
            .or_default()
            .extend(steps);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn fetches_for(&self, url: &str, offset: u64) -> usize {
        self.fetches
            .lock()
            .iter()
            .filter(|(u, o)| u == url && *o == offset)
            .count()
    }
}

impl ChunkTransfer for ScriptedTransfer {
    fn fetch(
        &self,
        request: TransferRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<TransferReceipt, TransferError>> {
        Box::pin(async move {
            let offset = request.range.map(|(start, _)| start).unwrap_or(0);
            let key = (request.url.clone(), offset);
            self.fetches.lock().push(key.clone());
            let step = self.script.lock().get_mut(&key).and_then(|q| q.pop_front());

            match &step {
                Some(Step::Fail) => return Err(TransferError::Http { status: 503 }),
                Some(Step::Hang) => {
                    cancel.cancelled().await;
                    return Err(TransferError::Cancelled);
                }
                Some(Step::Hold(gate)) => {
                    tokio::select! {
                        _ = gate.notified() => {}
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    }
                }
                Some(Step::Corrupt) | None => {}
            }

            let body = self
                .bodies
                .get(&request.url)
                .ok_or(TransferError::Http { status: 404 })?;
            let mut data = match request.range {
                Some((start, end)) => body[start as usize..=end as usize].to_vec(),
                None => body.clone(),
            };
            if matches!(step, Some(Step::Corrupt)) {
                data[0] ^= 0xff;
            }

            if let Some(parent) = request.temp_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&request.temp_path, &data).await?;
            progress(data.len() as u64);

            Ok(TransferReceipt {
                path: request.temp_path,
                bytes: data.len() as u64,
            })
        })
    }
}

// ============================================================================
// Fixed-capacity storage
// ============================================================================

/// Storage advisor reporting a fixed capacity.
#[derive(Debug, Clone, Copy)]
pub struct FixedStorage {
    pub info: StorageInfo,
    pub margin: u64,
}

impl FixedStorage {
    pub fn new(total: u64, available: u64, margin: u64) -> Self {
        Self {
            info: StorageInfo {
                total,
                available,
                used_by_app: 0,
            },
            margin,
        }
    }

    pub fn plenty() -> Self {
        Self::new(64 * GB, 32 * GB, 0)
    }
}

impl StorageAdvisor for FixedStorage {
    fn check(&self, required: u64) -> DownloadResult<StorageInfo> {
        admit(required, self.info, self.margin)
    }

    fn info(&self) -> DownloadResult<StorageInfo> {
        Ok(self.info)
    }
}

/// Storage advisor whose free space can shrink while downloads run.
#[derive(Debug, Clone)]
pub struct ShrinkingStorage {
    info: Arc<Mutex<StorageInfo>>,
}

impl ShrinkingStorage {
    pub fn new(total: u64, available: u64) -> Self {
        Self {
            info: Arc::new(Mutex::new(StorageInfo {
                total,
                available,
                used_by_app: 0,
            })),
        }
    }

    pub fn set_available(&self, available: u64) {
        self.info.lock().available = available;
    }
}

impl StorageAdvisor for ShrinkingStorage {
    fn check(&self, required: u64) -> DownloadResult<StorageInfo> {
        admit(required, *self.info.lock(), 0)
    }

    fn info(&self) -> DownloadResult<StorageInfo> {
        Ok(*self.info.lock())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Configuration with byte-sized chunks and millisecond backoff.
pub fn test_config(dir: &Path) -> DownloadConfig {
    DownloadConfig::new(dir.join("work"))
        .with_output_dir(dir.join("out"))
        .with_chunk_size(100)
        .with_max_concurrent_chunks(2)
        .with_retry(RetryPolicy::new(
            3,
            Duration::from_millis(5),
            Duration::from_millis(20),
        ))
        .with_progress_interval(Duration::ZERO)
}

/// Launch an orchestrator wired to the given fakes.
pub async fn launch(
    config: DownloadConfig,
    transfer: Arc<ScriptedTransfer>,
    store: Option<Arc<dyn TaskStore>>,
    storage: impl StorageAdvisor + 'static,
) -> DownloadResult<(DownloadOrchestrator, mpsc::UnboundedReceiver<DownloadEvent>)> {
    let (listener, events) = ChannelListener::new();
    let mut builder = DownloadOrchestrator::builder(config)
        .transfer(transfer)
        .storage(Arc::new(storage))
        .listener(Arc::new(listener));
    if let Some(store) = store {
        builder = builder.store(store);
    }
    Ok((builder.launch().await?, events))
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Next terminal outcome, skipping progress events.
pub async fn next_outcome(
    events: &mut mpsc::UnboundedReceiver<DownloadEvent>,
) -> (TaskId, Result<CompletedArtifact, DownloadError>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(DownloadEvent::Finished { task_id, outcome }) => return (task_id, outcome),
                Some(DownloadEvent::Progress(_)) => continue,
                None => panic!("listener channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a task outcome")
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
