//! In-process transfer counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::worker::RunOutcome;

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    tasks_enqueued: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_paused: AtomicU64,
    tasks_cancelled: AtomicU64,
    bytes_completed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_enqueued(&self) {
        self.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_enqueued", "Metric incremented");
    }

    pub fn task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_dispatched", "Metric incremented");
    }

    pub fn task_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_cancelled", "Metric incremented");
    }

    /// Count a worker's final outcome
    pub fn record_outcome(&self, outcome: &RunOutcome) {
        let counter = match outcome {
            RunOutcome::Completed { bytes } => {
                self.bytes_completed.fetch_add(*bytes, Ordering::Relaxed);
                &self.tasks_completed
            }
            RunOutcome::Paused(_) => &self.tasks_paused,
            RunOutcome::Cancelled => &self.tasks_cancelled,
            RunOutcome::Requeued { .. } => &self.tasks_retried,
            RunOutcome::Failed { .. } => &self.tasks_failed,
            RunOutcome::Aborted { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_paused: self.tasks_paused.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            bytes_completed: self.bytes_completed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_enqueued: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_paused: u64,
    pub tasks_cancelled: u64,
    pub bytes_completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_outcomes_are_counted() {
        let metrics = Metrics::new();
        metrics.task_enqueued();
        metrics.record_outcome(&RunOutcome::Completed { bytes: 1000 });
        metrics.record_outcome(&RunOutcome::Requeued {
            retry_count: 1,
            delay: Duration::from_secs(2),
        });
        metrics.record_outcome(&RunOutcome::Aborted {
            reason: "store offline".into(),
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_enqueued, 1);
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.bytes_completed, 1000);
        assert_eq!(snapshot.tasks_retried, 1);
        assert_eq!(snapshot.tasks_failed, 0);
    }
}
