//! Download manager - the public facade over store, scheduler and workers
//!
//! Owns the single store handle and injects it into the scheduler and the
//! workers. Lifecycle is explicit: [`DownloadManager::start`] opens the
//! store, recovers interrupted work and spawns the scheduler and retention
//! loops; [`DownloadManager::shutdown`] stops dispatching, pauses running
//! transfers back into the queue and syncs the store.

use chrono::{Duration as TimeDelta, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::network::NetworkMonitor;
use crate::observability::{Metrics, MetricsSnapshot};
use crate::scheduler::Scheduler;
use crate::store::{ListQuery, StoreError, StoreStats, TaskStore};
use crate::task::{LinkType, NewTask, TaskRecord, TaskStatus};
use crate::worker::{
    HttpSource, PauseReason, ReqwestSource, TaskRunner, TaskSignal, TransferError, WorkerPool,
};

/// Attempts to reach a worker for a task the store reports as `running`
const STOP_ATTEMPTS: usize = 50;
const STOP_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cannot {action} task {id}: it is {status}")]
    InvalidState {
        id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Task {0} is running but no worker acknowledged the signal")]
    NotRunning(String),

    #[error("Failed to build HTTP source: {0}")]
    Source(#[from] TransferError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

pub struct DownloadManager {
    store: Arc<TaskStore>,
    pool: WorkerPool,
    network: NetworkMonitor,
    metrics: Arc<Metrics>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Start with a reqwest-backed source built from `config.http`
    pub async fn open(config: &Config) -> Result<Arc<Self>> {
        let source = ReqwestSource::new(&config.http.client_config(), config.http.proxy.as_deref())?;
        Self::start(config, Arc::new(source)).await
    }

    /// Open the store, requeue interrupted tasks and start the background loops
    pub async fn start(config: &Config, source: Arc<dyn HttpSource>) -> Result<Arc<Self>> {
        let store = Arc::new(TaskStore::open(&config.server.data_dir)?);
        let metrics = Arc::new(Metrics::new());
        let network = NetworkMonitor::new(config.scheduler.initial_link);

        let runner = Arc::new(TaskRunner::new(
            store.clone(),
            source,
            config.retry.policy(),
            config.worker.runner_config(),
        ));
        let (pool, reports) = WorkerPool::new(config.scheduler.workers, runner);

        let scheduler = Scheduler::new(
            store.clone(),
            pool.clone(),
            network.clone(),
            metrics.clone(),
            config.scheduler.tick_interval(),
        );
        scheduler.recover()?;
        let wake = scheduler.waker();

        let shutdown = CancellationToken::new();
        let scheduler_task = tokio::spawn(scheduler.run(reports, shutdown.child_token()));
        let retention_task = tokio::spawn(retention_loop(
            store.clone(),
            config.retention.completed_ttl(),
            config.retention.purge_interval(),
            shutdown.child_token(),
        ));

        info!(
            workers = config.scheduler.workers,
            link = %network.current(),
            data_dir = %config.server.data_dir.display(),
            "Download manager started"
        );
        wake.notify_one();

        Ok(Arc::new(Self {
            store,
            pool,
            network,
            metrics,
            wake,
            shutdown,
            background: Mutex::new(vec![scheduler_task, retention_task]),
        }))
    }

    /// Create a queued task and return its id
    pub fn enqueue(&self, request: NewTask) -> Result<String> {
        validate_request(&request)?;
        let task = TaskRecord::new(request, Utc::now());
        self.store.put(&task)?;
        self.metrics.task_enqueued();
        info!(
            task_id = %task.id,
            url = %task.source_url,
            priority = task.priority.as_str(),
            "Task enqueued"
        );
        self.wake();
        Ok(task.id)
    }

    pub fn get(&self, id: &str) -> Result<TaskRecord> {
        Ok(self.store.get(id)?)
    }

    pub fn list(&self, query: &ListQuery) -> Result<Vec<TaskRecord>> {
        Ok(self.store.list(query)?)
    }

    pub fn list_by_content(&self, identifier: &str) -> Result<Vec<TaskRecord>> {
        Ok(self.store.list_by_content(identifier)?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats()?)
    }

    /// Suspend a running task. It stays `paused` until resumed.
    pub async fn pause(&self, id: &str) -> Result<TaskRecord> {
        let task = self.store.get(id)?;
        if task.status != TaskStatus::Running {
            return Err(invalid_state(&task, "pause"));
        }
        match self.stop_running(id, TaskSignal::Pause(PauseReason::User)).await? {
            Some(task) => Ok(task),
            None => Err(invalid_state(&self.store.get(id)?, "pause")),
        }
    }

    /// Put a paused task back in the queue
    pub fn resume(&self, id: &str) -> Result<TaskRecord> {
        let result = self.store.update(id, &[TaskStatus::Paused], |task| {
            task.requeue(Utc::now())?;
            Ok(())
        });
        let task = self.conflict_as_invalid(id, result, "resume")?;
        debug!(task_id = %id, "Task resumed");
        self.wake();
        Ok(task)
    }

    /// Cancel a task in any non-terminal state. For a running task this
    /// returns only after its worker has stopped.
    pub async fn cancel(&self, id: &str) -> Result<TaskRecord> {
        for _ in 0..STOP_ATTEMPTS {
            let task = self.store.get(id)?;
            match task.status {
                TaskStatus::Queued | TaskStatus::Paused => {
                    let result =
                        self.store
                            .update(id, &[TaskStatus::Queued, TaskStatus::Paused], |task| {
                                task.cancel(Utc::now())?;
                                Ok(())
                            });
                    match result {
                        Ok(task) => {
                            self.metrics.task_cancelled();
                            info!(task_id = %id, "Task cancelled");
                            return Ok(task);
                        }
                        // claimed by the scheduler in the meantime
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                TaskStatus::Running => {
                    if let Some(task) = self.stop_running(id, TaskSignal::Cancel).await? {
                        return Ok(task);
                    }
                }
                _ => return Err(invalid_state(&task, "cancel")),
            }
        }
        Err(ManagerError::NotRunning(id.to_string()))
    }

    /// Manually requeue a task that exhausted its retries or failed permanently
    pub fn retry(&self, id: &str) -> Result<TaskRecord> {
        let result = self.store.update(id, &[TaskStatus::Failed], |task| {
            task.requeue(Utc::now())?;
            Ok(())
        });
        let task = self.conflict_as_invalid(id, result, "retry")?;
        info!(task_id = %id, retry_count = task.retry_count, "Task manually retried");
        self.wake();
        Ok(task)
    }

    /// Remove a task record. A running task is cancelled first. Files on
    /// disk are left in place.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.store.get(id)?.status == TaskStatus::Running {
            self.stop_running(id, TaskSignal::Cancel).await?;
        }
        self.store.delete(id)?;
        info!(task_id = %id, "Task deleted");
        Ok(())
    }

    pub fn purge_completed(&self, max_age: TimeDelta) -> Result<usize> {
        Ok(self.store.purge_completed_older_than(max_age, Utc::now())?)
    }

    /// Report a link change from the platform network observer
    pub fn set_network(&self, link: LinkType) -> bool {
        let changed = self.network.set(link);
        if changed {
            self.wake();
        }
        changed
    }

    pub fn network(&self) -> LinkType {
        self.network.current()
    }

    /// Request an immediate scheduling pass (foregrounding, new work)
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn active_workers(&self) -> usize {
        self.pool.capacity() - self.pool.available()
    }

    pub fn worker_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Stop dispatching, return running transfers to the queue and sync
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down download manager");
        self.shutdown.cancel();

        let handles = {
            let mut background = self
                .background
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *background)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.pool
            .stop_all(TaskSignal::Pause(PauseReason::Shutdown))
            .await;
        self.store.persist()?;
        info!("Download manager stopped");
        Ok(())
    }

    /// Signal the worker running `id` and wait for it to stop. Returns the
    /// stored record afterwards, or `None` if the task stopped running
    /// before a worker could be reached.
    async fn stop_running(&self, id: &str, signal: TaskSignal) -> Result<Option<TaskRecord>> {
        for _ in 0..STOP_ATTEMPTS {
            if self.pool.stop(id, signal).await {
                return Ok(Some(self.store.get(id)?));
            }
            // claimed but not yet handed to a worker, or just finishing
            if self.store.get(id)?.status != TaskStatus::Running {
                return Ok(None);
            }
            tokio::time::sleep(STOP_RETRY_DELAY).await;
        }
        Err(ManagerError::NotRunning(id.to_string()))
    }

    fn conflict_as_invalid(
        &self,
        id: &str,
        result: std::result::Result<TaskRecord, StoreError>,
        action: &'static str,
    ) -> Result<TaskRecord> {
        match result {
            Ok(task) => Ok(task),
            Err(StoreError::Conflict { actual, .. }) => Err(ManagerError::InvalidState {
                id: id.to_string(),
                status: actual,
                action,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn invalid_state(task: &TaskRecord, action: &'static str) -> ManagerError {
    ManagerError::InvalidState {
        id: task.id.clone(),
        status: task.status,
        action,
    }
}

/// Reject requests that can never be downloaded: non-http urls and file
/// names that would escape `destination_path`
pub fn validate_request(request: &NewTask) -> Result<()> {
    let url = reqwest::Url::parse(&request.source_url)
        .map_err(|e| ManagerError::InvalidRequest(format!("invalid url '{}': {}", request.source_url, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ManagerError::InvalidRequest(format!(
            "unsupported url scheme '{}'",
            url.scheme()
        )));
    }
    if request.file_name.trim().is_empty() {
        return Err(ManagerError::InvalidRequest("file_name is empty".to_string()));
    }
    if request.file_name.contains(['/', '\\']) || request.file_name == ".." {
        return Err(ManagerError::InvalidRequest(format!(
            "file_name '{}' must not contain path separators",
            request.file_name
        )));
    }
    if request.destination_path.as_os_str().is_empty() {
        return Err(ManagerError::InvalidRequest(
            "destination_path is empty".to_string(),
        ));
    }
    Ok(())
}

async fn retention_loop(
    store: Arc<TaskStore>,
    ttl: TimeDelta,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.purge_completed_older_than(ttl, Utc::now()) {
                    warn!(error = %e, "Retention purge failed");
                }
            }
        }
    }
}
