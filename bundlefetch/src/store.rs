//! Durable task records.
//!
//! The orchestrator engine writes the full registry after every state
//! transition and reads it once at startup. [`JsonTaskStore`] keeps one JSON
//! document on disk, replaced atomically (write temp file, fsync, rename), and
//! holds an advisory lock so only one orchestrator can own it.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::model::DownloadTask;

/// Current on-disk document version.
pub const STORE_VERSION: u32 = 1;

/// Persistence backend for task records.
pub trait TaskStore: Send + Sync {
    /// Replace the stored registry with `tasks`.
    fn persist(&self, tasks: &[DownloadTask]) -> DownloadResult<()>;

    /// Read every stored task.
    fn load(&self) -> DownloadResult<Vec<DownloadTask>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    saved_at: DateTime<Utc>,
    tasks: BTreeMap<String, DownloadTask>,
}

/// JSON file store with a single-owner lock.
#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    // Held for the store's lifetime; the lock is released when it is dropped.
    _lock: File,
}

impl JsonTaskStore {
    /// Open (or prepare) the store at `path` and take its lock.
    ///
    /// # Errors
    ///
    /// `StoreLocked` if another process already holds `<path>.lock`.
    pub fn open(path: impl Into<PathBuf>) -> DownloadResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
        }

        let lock_path = sibling(&path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| DownloadError::io(&lock_path, e))?;

        lock.try_lock_exclusive().map_err(|e| {
            if e.kind() == fs2::lock_contended_error().kind() {
                DownloadError::StoreLocked {
                    path: path.clone(),
                }
            } else {
                DownloadError::io(&lock_path, e)
            }
        })?;

        debug!(path = %path.display(), "Task store opened");
        Ok(Self { path, _lock: lock })
    }

    /// Path of the JSON document.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TaskStore for JsonTaskStore {
    fn persist(&self, tasks: &[DownloadTask]) -> DownloadResult<()> {
        let document = StoreDocument {
            version: STORE_VERSION,
            saved_at: Utc::now(),
            tasks: tasks
                .iter()
                .map(|t| (t.id.to_string(), t.clone()))
                .collect(),
        };

        // Write to temp file first, then rename for atomicity
        let temp_path = sibling(&self.path, "tmp");
        let file = File::create(&temp_path).map_err(|e| DownloadError::io(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &document)
            .map_err(|e| DownloadError::Store(format!("failed to serialize tasks: {}", e)))?;
        writer
            .flush()
            .map_err(|e| DownloadError::io(&temp_path, e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| DownloadError::io(&temp_path, e))?;
        drop(writer);

        fs::rename(&temp_path, &self.path).map_err(|e| DownloadError::io(&self.path, e))?;

        debug!(tasks = tasks.len(), "Task store persisted");
        Ok(())
    }

    fn load(&self) -> DownloadResult<Vec<DownloadTask>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DownloadError::io(&self.path, e)),
        };

        let document: StoreDocument = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| DownloadError::Store(format!("failed to parse task store: {}", e)))?;

        if document.version > STORE_VERSION {
            return Err(DownloadError::Store(format!(
                "task store version {} is newer than supported version {}",
                document.version, STORE_VERSION
            )));
        }

        let mut tasks = Vec::with_capacity(document.tasks.len());
        for (key, task) in document.tasks {
            if key != task.id.as_str() {
                warn!(key = %key, task_id = %task.id, "Skipping task stored under wrong key");
                continue;
            }
            if let Err(e) = task.validate() {
                warn!(task_id = %task.id, error = %e, "Skipping invalid stored task");
                continue;
            }
            tasks.push(task);
        }

        info!(tasks = tasks.len(), saved_at = %document.saved_at, "Task store loaded");
        Ok(tasks)
    }
}

/// In-process store for embedders and tests.
///
/// Cheap to share via `Arc`; a restarted orchestrator handed the same
/// instance sees exactly what the previous one persisted.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<DownloadTask>>,
    persists: AtomicUsize,
}

impl MemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `tasks`.
    pub fn with_tasks(tasks: Vec<DownloadTask>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            persists: AtomicUsize::new(0),
        }
    }

    /// Snapshot of the last persisted registry.
    pub fn snapshot(&self) -> Vec<DownloadTask> {
        self.tasks.lock().clone()
    }

    /// Number of `persist` calls so far.
    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }
}

impl TaskStore for MemoryTaskStore {
    fn persist(&self, tasks: &[DownloadTask]) -> DownloadResult<()> {
        *self.tasks.lock() = tasks.to_vec();
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> DownloadResult<Vec<DownloadTask>> {
        Ok(self.tasks.lock().clone())
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkLocator, ContentType, DownloadChunk, Priority, TaskId, TaskStatus};
    use tempfile::TempDir;

    fn sample_task(id: &str) -> DownloadTask {
        let id = TaskId::from(id);
        let now = Utc::now();
        DownloadTask {
            chunks: vec![
                DownloadChunk::new(&id, 0, 0, 100, ChunkLocator::ranged("http://a"), None),
                DownloadChunk::new(&id, 1, 100, 50, ChunkLocator::ranged("http://a"), None),
            ],
            id,
            content_type: ContentType::OptionalModule,
            priority: Priority::Medium,
            total_size: 150,
            chunk_size: 100,
            status: TaskStatus::Downloading,
            destination: PathBuf::from("/tmp/out.bin"),
            artifact_digest: Some("abc".into()),
            label: Some("wikipedia".into()),
            retry_rounds: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn test_json_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = JsonTaskStore::open(temp.path().join("state").join("tasks.json")).unwrap();

        let mut task = sample_task("t1");
        task.chunks[0].begin().unwrap();
        task.chunks[0].complete("d0".into(), false).unwrap();
        store.persist(&[task.clone(), sample_task("t2")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        let t1 = loaded.iter().find(|t| t.id.as_str() == "t1").unwrap();
        assert_eq!(t1, &task);
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonTaskStore::open(temp.path().join("tasks.json")).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_replace_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.json");
        let store = JsonTaskStore::open(&path).unwrap();

        store.persist(&[sample_task("t1")]).unwrap();
        store.persist(&[]).unwrap();

        assert!(store.load().unwrap().is_empty());
        assert!(!sibling(&path, "tmp").exists());
    }

    #[test]
    fn test_json_store_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.json");

        let first = JsonTaskStore::open(&path).unwrap();
        let second = JsonTaskStore::open(&path);
        assert!(matches!(second, Err(DownloadError::StoreLocked { .. })));

        drop(first);
        assert!(JsonTaskStore::open(&path).is_ok());
    }

    #[test]
    fn test_json_store_skips_invalid_tasks() {
        let temp = TempDir::new().unwrap();
        let store = JsonTaskStore::open(temp.path().join("tasks.json")).unwrap();

        let mut broken = sample_task("broken");
        broken.total_size = 999;
        store.persist(&[broken, sample_task("ok")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id.as_str(), "ok");
    }

    #[test]
    fn test_json_store_rejects_corrupt_document() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = JsonTaskStore::open(&path).unwrap();
        assert!(matches!(store.load(), Err(DownloadError::Store(_))));
    }

    #[test]
    fn test_memory_store_counts_persists() {
        let store = MemoryTaskStore::new();
        store.persist(&[sample_task("t1")]).unwrap();
        store.persist(&[sample_task("t1"), sample_task("t2")]).unwrap();

        assert_eq!(store.persist_count(), 2);
        assert_eq!(store.load().unwrap().len(), 2);
    }
}
