//! Public handle to a running orchestrator.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::engine::{Command, Engine, EngineParts};
use super::listener::{DownloadListener, NoopListener};
use super::progress::DownloadProgress;
use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult};
use crate::model::{DownloadRequest, DownloadTask, TaskId};
use crate::storage::{FsStorageAdvisor, StorageAdvisor, StorageInfo};
use crate::store::{JsonTaskStore, TaskStore};
use crate::transfer::{ChunkTransfer, HttpTransfer};

/// Capacity of the command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Cloneable handle to the orchestrator engine.
///
/// Every method is a round trip to the engine task. Once the engine has
/// stopped they fail with [`DownloadError::ShuttingDown`].
///
/// # Example
///
/// ```ignore
/// let orchestrator = DownloadOrchestrator::builder(config).launch().await?;
/// let id = orchestrator
///     .start(DownloadRequest::ranged("https://example.com/core.zim", size))
///     .await?;
/// orchestrator.wait_idle().await?;
/// ```
#[derive(Clone, Debug)]
pub struct DownloadOrchestrator {
    commands: mpsc::Sender<Command>,
}

impl DownloadOrchestrator {
    /// Start building an orchestrator.
    pub fn builder(config: DownloadConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Admit, plan and persist a new task, then begin transferring it.
    ///
    /// # Errors
    ///
    /// `InsufficientStorage` (nothing is created), `InvalidRequest` for a
    /// request that cannot be planned.
    pub async fn start(&self, request: DownloadRequest) -> DownloadResult<TaskId> {
        self.call(|reply| Command::Start { request, reply }).await?
    }

    /// Pause a task. Pausing a paused task is a no-op.
    pub async fn pause(&self, task_id: &TaskId) -> DownloadResult<()> {
        let task_id = task_id.clone();
        self.call(|reply| Command::Pause { task_id, reply }).await?
    }

    /// Resume a paused task, or start a new retry round for a failed one.
    /// Resuming a downloading task is a no-op.
    pub async fn resume(&self, task_id: &TaskId) -> DownloadResult<()> {
        let task_id = task_id.clone();
        self.call(|reply| Command::Resume { task_id, reply }).await?
    }

    /// Cancel a task and delete everything it left on disk.
    pub async fn cancel(&self, task_id: &TaskId) -> DownloadResult<()> {
        let task_id = task_id.clone();
        self.call(|reply| Command::Cancel { task_id, reply }).await?
    }

    /// Current progress snapshot of a task.
    pub async fn progress(&self, task_id: &TaskId) -> DownloadResult<DownloadProgress> {
        let task_id = task_id.clone();
        self.call(|reply| Command::Progress { task_id, reply }).await?
    }

    /// Every registered task, by priority then creation time.
    pub async fn list_tasks(&self) -> DownloadResult<Vec<DownloadTask>> {
        self.call(|reply| Command::List { reply }).await
    }

    /// Capacity of the storage backing the work directory.
    pub async fn storage_info(&self) -> DownloadResult<StorageInfo> {
        self.call(|reply| Command::StorageInfo { reply }).await?
    }

    /// Pause every running task. Returns the ids that were paused.
    pub async fn pause_all(&self) -> DownloadResult<Vec<TaskId>> {
        self.call(|reply| Command::PauseAll { reply }).await
    }

    /// Wait until no task is downloading and no transfer is in flight.
    pub async fn wait_idle(&self) -> DownloadResult<()> {
        self.call(|reply| Command::WaitIdle { reply }).await
    }

    /// Stop the engine. In-flight transfers are interrupted without
    /// consuming retry budget and state is persisted.
    pub async fn shutdown(&self) -> DownloadResult<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> DownloadResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| DownloadError::ShuttingDown)?;
        rx.await.map_err(|_| DownloadError::ShuttingDown)
    }
}

/// Builder for [`DownloadOrchestrator`].
///
/// Collaborators not supplied explicitly default to the filesystem storage
/// advisor, the JSON task store, the HTTP transfer and a no-op listener.
pub struct OrchestratorBuilder {
    config: DownloadConfig,
    storage: Option<Arc<dyn StorageAdvisor>>,
    store: Option<Arc<dyn TaskStore>>,
    transfer: Option<Arc<dyn ChunkTransfer>>,
    listener: Option<Arc<dyn DownloadListener>>,
}

impl OrchestratorBuilder {
    fn new(config: DownloadConfig) -> Self {
        Self {
            config,
            storage: None,
            store: None,
            transfer: None,
            listener: None,
        }
    }

    /// Use a custom storage advisor.
    pub fn storage(mut self, storage: Arc<dyn StorageAdvisor>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a custom task store.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom chunk transfer.
    pub fn transfer(mut self, transfer: Arc<dyn ChunkTransfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Receive progress and completion callbacks.
    pub fn listener(mut self, listener: Arc<dyn DownloadListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Recover persisted tasks and spawn the engine on the current runtime.
    ///
    /// # Errors
    ///
    /// `InvalidConfig`, `StoreLocked` when another orchestrator owns the
    /// store, or any error reading the store.
    pub async fn launch(self) -> DownloadResult<DownloadOrchestrator> {
        let config = self.config;
        config.validate()?;

        let storage: Arc<dyn StorageAdvisor> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(FsStorageAdvisor::new(
                config.work_dir.clone(),
                config.safety_margin_bytes,
            )),
        };
        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => Arc::new(JsonTaskStore::open(config.store_path())?),
        };
        let transfer: Arc<dyn ChunkTransfer> = match self.transfer {
            Some(transfer) => transfer,
            None => Arc::new(HttpTransfer::with_timeout(config.request_timeout)?),
        };
        let listener: Arc<dyn DownloadListener> =
            self.listener.unwrap_or_else(|| Arc::new(NoopListener));

        debug!(work_dir = %config.work_dir.display(), "Launching download orchestrator");

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let engine = Engine::new(
            EngineParts {
                config,
                storage,
                store,
                transfer,
                listener,
            },
            rx,
        )?;
        tokio::spawn(engine.run());

        Ok(DownloadOrchestrator { commands: tx })
    }
}
