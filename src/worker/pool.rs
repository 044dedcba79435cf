//! Bounded pool of transfer workers

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::task::TaskRecord;

use super::runner::{RunOutcome, TaskRunner, TaskSignal};

/// Sent by a worker after it wrote its task's final state and released its slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub task_id: String,
    pub outcome: RunOutcome,
}

struct ActiveWorker {
    signal: watch::Sender<TaskSignal>,
    done: watch::Receiver<bool>,
}

/// Fixed-capacity set of concurrent workers keyed by task id
#[derive(Clone)]
pub struct WorkerPool {
    capacity: usize,
    runner: Arc<TaskRunner>,
    active: Arc<Mutex<HashMap<String, ActiveWorker>>>,
    reports: mpsc::UnboundedSender<WorkerReport>,
}

impl WorkerPool {
    pub fn new(
        capacity: usize,
        runner: Arc<TaskRunner>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let pool = Self {
            capacity,
            runner,
            active: Arc::new(Mutex::new(HashMap::new())),
            reports,
        };
        (pool, rx)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveWorker>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle worker slots
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.active().len())
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active().contains_key(task_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active().keys().cloned().collect()
    }

    /// Start a worker for a claimed task. Returns false when no slot is free
    /// or a worker for the same id is already running.
    pub fn dispatch(&self, task: TaskRecord) -> bool {
        let mut active = self.active();
        if active.len() >= self.capacity || active.contains_key(&task.id) {
            return false;
        }

        let (signal, signals) = watch::channel(TaskSignal::Run);
        let (done_tx, done) = watch::channel(false);
        active.insert(task.id.clone(), ActiveWorker { signal, done });
        drop(active);

        let pool = self.clone();
        tokio::spawn(async move {
            let task_id = task.id.clone();
            let outcome = pool.runner.run(task, signals).await;

            pool.active().remove(&task_id);
            let _ = done_tx.send(true);
            debug!(task_id = %task_id, "Worker released");

            if pool
                .reports
                .send(WorkerReport { task_id, outcome })
                .is_err()
            {
                warn!("Worker report dropped; scheduler is gone");
            }
        });
        true
    }

    /// Deliver a control signal without waiting. Returns false if no worker
    /// is running the task.
    pub fn signal(&self, task_id: &str, signal: TaskSignal) -> bool {
        match self.active().get(task_id) {
            Some(worker) => {
                let _ = worker.signal.send(signal);
                true
            }
            None => false,
        }
    }

    /// Deliver a control signal and wait until the worker has written its
    /// final state and exited
    pub async fn stop(&self, task_id: &str, signal: TaskSignal) -> bool {
        let done = {
            let active = self.active();
            let Some(worker) = active.get(task_id) else {
                return false;
            };
            let _ = worker.signal.send(signal);
            worker.done.clone()
        };
        wait_done(done).await;
        true
    }

    /// Signal every worker and wait for all of them to exit
    pub async fn stop_all(&self, signal: TaskSignal) {
        let waiters: Vec<watch::Receiver<bool>> = {
            let active = self.active();
            active
                .values()
                .map(|worker| {
                    let _ = worker.signal.send(signal);
                    worker.done.clone()
                })
                .collect()
        };
        for done in waiters {
            wait_done(done).await;
        }
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    // A dropped sender means the worker task ended without reporting.
    let _ = done.wait_for(|finished| *finished).await;
}
