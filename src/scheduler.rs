//! Scheduler - single serialized dispatch loop
//!
//! Each tick lists `queued` tasks in dispatch order (priority desc, then
//! creation time asc), filters them by eligibility, claims them in the store
//! and hands them to idle workers until either list or capacity runs out.
//! Running transfers are never preempted.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::NetworkMonitor;
use crate::observability::Metrics;
use crate::store::{ListQuery, StoreError, TaskStore};
use crate::task::{LinkType, TaskRecord, TaskStatus};
use crate::worker::{PauseReason, RunOutcome, TaskSignal, WorkerPool, WorkerReport};

/// Whether a queued task may be dispatched right now
pub fn is_eligible(task: &TaskRecord, now: DateTime<Utc>, link: LinkType) -> bool {
    task.status == TaskStatus::Queued
        && task.scheduled_time.is_none_or(|at| at <= now)
        && task.network_requirement.is_satisfied_by(link)
}

pub struct Scheduler {
    store: Arc<TaskStore>,
    pool: WorkerPool,
    network: NetworkMonitor,
    metrics: Arc<Metrics>,
    tick_interval: Duration,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        pool: WorkerPool,
        network: NetworkMonitor,
        metrics: Arc<Metrics>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            network,
            metrics,
            tick_interval,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle used to request an immediate tick
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Return tasks left `running` by a previous process to the queue
    pub fn recover(&self) -> Result<Vec<String>, StoreError> {
        let recovered = self.store.reconcile_interrupted(Utc::now())?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered interrupted tasks");
        }
        Ok(recovered)
    }

    /// One scheduling pass. Returns the ids dispatched, in dispatch order.
    pub fn tick(&self) -> Vec<String> {
        self.requeue_network_paused();

        let mut dispatched = Vec::new();
        let available = self.pool.available();
        if available == 0 {
            return dispatched;
        }

        let now = Utc::now();
        let link = self.network.current();
        let queued = match self.store.list(&ListQuery::status(TaskStatus::Queued)) {
            Ok(queued) => queued,
            Err(e) => {
                warn!(error = %e, "Skipping scheduler tick: store unavailable");
                return dispatched;
            }
        };

        for task in queued {
            if dispatched.len() >= available {
                break;
            }
            if !is_eligible(&task, now, link) || self.pool.is_active(&task.id) {
                continue;
            }

            let claimed = match self.store.claim(&task.id, now) {
                Ok(claimed) => claimed,
                Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Skipping scheduler tick: claim failed");
                    break;
                }
            };

            if self.pool.dispatch(claimed) {
                debug!(task_id = %task.id, priority = task.priority.as_str(), "Dispatched task");
                self.metrics.task_dispatched();
                dispatched.push(task.id);
            } else {
                warn!(task_id = %task.id, "No worker slot after claim; returning task to queue");
                self.release(&task.id);
                break;
            }
        }

        dispatched
    }

    /// Pause running tasks whose network requirement is no longer met
    pub fn enforce_network(&self) -> usize {
        let link = self.network.current();
        let mut paused = 0;

        for id in self.pool.active_ids() {
            let task = match self.store.get(&id) {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Cannot check network requirement");
                    continue;
                }
            };
            if !task.network_requirement.is_satisfied_by(link)
                && self.pool.signal(&id, TaskSignal::Pause(PauseReason::Network))
            {
                info!(task_id = %id, link = %link, "Pausing task: network requirement not met");
                paused += 1;
            }
        }

        paused
    }

    /// Return tasks paused for the network to the queue once the current
    /// link satisfies their requirement. User pauses are left alone.
    pub fn requeue_network_paused(&self) -> Vec<String> {
        let link = self.network.current();
        let paused = match self.store.list(&ListQuery::status(TaskStatus::Paused)) {
            Ok(paused) => paused,
            Err(e) => {
                warn!(error = %e, "Cannot list paused tasks");
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut requeued = Vec::new();
        for task in paused.into_iter().filter(|t| t.network_restored(link)) {
            let result = self.store.update(&task.id, &[TaskStatus::Paused], |t| {
                if t.network_restored(link) {
                    t.requeue(now)?;
                }
                Ok(())
            });
            match result {
                Ok(task) if task.status == TaskStatus::Queued => {
                    info!(task_id = %task.id, link = %link, "Network requirement met again; requeued task");
                    requeued.push(task.id);
                }
                Ok(_) | Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to requeue paused task"),
            }
        }
        requeued
    }

    pub fn handle_report(&self, report: &WorkerReport) {
        self.metrics.record_outcome(&report.outcome);
        if let RunOutcome::Aborted { reason } = &report.outcome {
            warn!(task_id = %report.task_id, reason = %reason, "Worker could not record its outcome");
            if !self.pool.is_active(&report.task_id) {
                self.release(&report.task_id);
            }
        }
    }

    /// Put a `running` task without a worker back in the queue
    fn release(&self, id: &str) {
        let now = Utc::now();
        let result = self.store.update(id, &[TaskStatus::Running], |task| {
            task.pause(PauseReason::Shutdown, now)?;
            task.requeue(now)?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(task_id = %id, error = %e, "Failed to return task to queue");
        }
    }

    /// Drive ticks until `shutdown` is cancelled.
    ///
    /// Ticks happen on the fixed interval, when a worker reports, when the
    /// link changes, when woken explicitly, and when the next deferred task
    /// becomes due.
    pub async fn run(
        self,
        mut reports: mpsc::UnboundedReceiver<WorkerReport>,
        shutdown: CancellationToken,
    ) {
        info!(interval_ms = self.tick_interval.as_millis() as u64, "Scheduler started");

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut link_changes = self.network.subscribe();

        loop {
            let next_due = match self.store.next_scheduled_after(Utc::now()) {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "Cannot read deferred tasks");
                    None
                }
            };
            let due = async move {
                match next_due {
                    Some(at) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or_default();
                        tokio::time::sleep(wait + Duration::from_millis(1)).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                Some(report) = reports.recv() => self.handle_report(&report),
                changed = link_changes.changed() => {
                    if changed.is_ok() {
                        self.enforce_network();
                    }
                }
                _ = self.wake.notified() => {}
                _ = due => {}
            }

            let dispatched = self.tick();
            if !dispatched.is_empty() {
                debug!(count = dispatched.len(), "Scheduler tick dispatched tasks");
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::task::{NetworkRequirement, NewTask, Priority};
    use crate::worker::error::Result;
    use crate::worker::{FetchRequest, HttpSource, RunnerConfig, SourceResponse, TaskRunner};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct StalledSource;

    #[async_trait]
    impl HttpSource for StalledSource {
        async fn fetch(&self, _request: FetchRequest) -> Result<SourceResponse> {
            std::future::pending().await
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<TaskStore>,
        network: NetworkMonitor,
        _temp: TempDir,
    }

    fn fixture(capacity: usize, link: LinkType) -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(temp.path().join("tasks")).unwrap());
        let runner = Arc::new(TaskRunner::new(
            store.clone(),
            Arc::new(StalledSource),
            RetryPolicy::default(),
            RunnerConfig::default(),
        ));
        let (pool, _reports) = WorkerPool::new(capacity, runner);
        let network = NetworkMonitor::new(link);
        let scheduler = Scheduler::new(
            store.clone(),
            pool,
            network.clone(),
            Arc::new(Metrics::new()),
            Duration::from_millis(50),
        );
        Fixture {
            scheduler,
            store,
            network,
            _temp: temp,
        }
    }

    fn enqueue(store: &TaskStore, name: &str, priority: Priority, created_secs: i64) -> TaskRecord {
        let task = TaskRecord::new(
            NewTask::builder()
                .source_url(format!("https://archive.example.org/{name}"))
                .destination_path("/tmp/tidefetch-scheduler-test")
                .file_name(name)
                .priority(priority)
                .build(),
            Utc.timestamp_opt(1_700_000_000 + created_secs, 0).unwrap(),
        );
        store.put(&task).unwrap();
        task
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        let mut task = TaskRecord::new(
            NewTask::builder()
                .source_url("https://archive.example.org/a")
                .destination_path("/tmp")
                .file_name("a")
                .network_requirement(NetworkRequirement::Unmetered)
                .build(),
            now,
        );
        assert!(is_eligible(&task, now, LinkType::Unmetered));
        assert!(!is_eligible(&task, now, LinkType::Metered));
        assert!(!is_eligible(&task, now, LinkType::Offline));

        task.scheduled_time = Some(now + chrono::Duration::seconds(30));
        assert!(!is_eligible(&task, now, LinkType::Unmetered));
        assert!(is_eligible(
            &task,
            now + chrono::Duration::seconds(30),
            LinkType::Unmetered
        ));

        task.status = TaskStatus::Paused;
        assert!(!is_eligible(&task, now + chrono::Duration::hours(1), LinkType::Unmetered));
    }

    #[tokio::test]
    async fn test_tick_dispatches_in_priority_then_creation_order() {
        let f = fixture(3, LinkType::Unmetered);
        let low = enqueue(&f.store, "low", Priority::Low, 0);
        let normal_new = enqueue(&f.store, "normal-new", Priority::Normal, 5);
        let high = enqueue(&f.store, "high", Priority::High, 9);
        let normal_old = enqueue(&f.store, "normal-old", Priority::Normal, 1);

        let dispatched = f.scheduler.tick();
        assert_eq!(dispatched, vec![high.id, normal_old.id, normal_new.id]);

        assert_eq!(f.store.get(&low.id).unwrap().status, TaskStatus::Queued);
        // no idle capacity left
        assert!(f.scheduler.tick().is_empty());
    }

    #[tokio::test]
    async fn test_high_priority_wins_single_slot() {
        let f = fixture(1, LinkType::Unmetered);
        let normal = enqueue(&f.store, "normal", Priority::Normal, 0);
        let high = enqueue(&f.store, "high", Priority::High, 10);

        assert_eq!(f.scheduler.tick(), vec![high.id.clone()]);
        assert_eq!(f.store.get(&high.id).unwrap().status, TaskStatus::Running);
        assert_eq!(f.store.get(&normal.id).unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_unmet_network_requirement_is_never_dispatched() {
        let f = fixture(2, LinkType::Metered);
        let task = TaskRecord::new(
            NewTask::builder()
                .source_url("https://archive.example.org/big")
                .destination_path("/tmp/tidefetch-scheduler-test")
                .file_name("big")
                .network_requirement(NetworkRequirement::Unmetered)
                .build(),
            Utc::now(),
        );
        f.store.put(&task).unwrap();

        assert!(f.scheduler.tick().is_empty());
        assert!(f.scheduler.tick().is_empty());

        f.network.set(LinkType::Unmetered);
        assert_eq!(f.scheduler.tick(), vec![task.id]);
    }

    #[tokio::test]
    async fn test_deferred_task_waits_for_its_start_time() {
        let f = fixture(2, LinkType::Unmetered);
        let mut task = enqueue(&f.store, "later", Priority::High, 0);
        task.scheduled_time = Some(Utc::now() + chrono::Duration::hours(1));
        f.store.put(&task).unwrap();

        assert!(f.scheduler.tick().is_empty());
        assert_eq!(
            f.store.next_scheduled_after(Utc::now()).unwrap(),
            task.scheduled_time
        );
    }

    async fn wait_for(store: &TaskStore, id: &str, status: TaskStatus) -> TaskRecord {
        for _ in 0..100 {
            let task = store.get(id).unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        store.get(id).unwrap()
    }

    #[tokio::test]
    async fn test_network_loss_pauses_until_link_returns() {
        let f = fixture(1, LinkType::Unmetered);
        let task = TaskRecord::new(
            NewTask::builder()
                .source_url("https://archive.example.org/big")
                .destination_path("/tmp/tidefetch-scheduler-test")
                .file_name("big")
                .network_requirement(NetworkRequirement::Unmetered)
                .build(),
            Utc::now(),
        );
        f.store.put(&task).unwrap();
        assert_eq!(f.scheduler.tick().len(), 1);

        f.network.set(LinkType::Metered);
        assert_eq!(f.scheduler.enforce_network(), 1);

        // the worker acknowledges by writing paused, never failed
        let stored = wait_for(&f.store, &task.id, TaskStatus::Paused).await;
        assert_eq!(stored.status, TaskStatus::Paused);
        assert_eq!(stored.pause_reason, Some(PauseReason::Network));
        assert!(stored.error_message.is_none());
        for _ in 0..100 {
            if f.scheduler.pool.available() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // still metered: ticks leave it paused
        assert!(f.scheduler.tick().is_empty());
        assert_eq!(f.store.get(&task.id).unwrap().status, TaskStatus::Paused);

        f.network.set(LinkType::Unmetered);
        assert_eq!(f.scheduler.tick(), vec![task.id.clone()]);
        let stored = f.store.get(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.pause_reason, None);
    }

    #[tokio::test]
    async fn test_user_pause_is_not_requeued_by_network() {
        let f = fixture(1, LinkType::Unmetered);
        let task = enqueue(&f.store, "held", Priority::Normal, 0);
        f.store.claim(&task.id, Utc::now()).unwrap();
        f.store
            .update(&task.id, &[TaskStatus::Running], |t| {
                t.pause(PauseReason::User, Utc::now())?;
                Ok(())
            })
            .unwrap();

        assert!(f.scheduler.requeue_network_paused().is_empty());
        assert!(f.scheduler.tick().is_empty());
        assert_eq!(f.store.get(&task.id).unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_repeated_ticks_dispatch_in_the_same_order() {
        let build = || {
            let f = fixture(3, LinkType::Unmetered);
            enqueue(&f.store, "low", Priority::Low, 0);
            enqueue(&f.store, "normal-new", Priority::Normal, 5);
            enqueue(&f.store, "high", Priority::High, 9);
            enqueue(&f.store, "normal-old", Priority::Normal, 1);
            enqueue(&f.store, "high-old", Priority::High, 2);
            f
        };
        let file_names = |f: &Fixture, ids: Vec<String>| -> Vec<String> {
            ids.iter()
                .map(|id| f.store.get(id).unwrap().file_name)
                .collect()
        };

        let first = build();
        let second = build();
        let first_order = file_names(&first, first.scheduler.tick());
        let second_order = file_names(&second, second.scheduler.tick());

        assert_eq!(first_order, vec!["high-old", "high", "normal-old"]);
        assert_eq!(first_order, second_order);
    }

    #[tokio::test]
    async fn test_recover_requeues_running_tasks() {
        let f = fixture(1, LinkType::Unmetered);
        let task = enqueue(&f.store, "interrupted", Priority::Normal, 0);
        f.store.claim(&task.id, Utc::now()).unwrap();

        assert_eq!(f.scheduler.recover().unwrap(), vec![task.id.clone()]);
        assert_eq!(f.scheduler.tick(), vec![task.id]);
    }
}
