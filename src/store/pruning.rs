/// Retention for finished tasks
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::task::TaskStatus;

use super::error::Result;
use super::partitions::{encode_meta_key, META_LAST_PURGE};
use super::store::{ListQuery, TaskStore};

/// Default retention for completed tasks (days)
pub const RETENTION_COMPLETED_DAYS: i64 = 30;

impl TaskStore {
    /// Delete completed tasks whose `completed_at` is older than `max_age`.
    /// Files already on disk are left alone. An age reaching past the earliest
    /// representable instant purges nothing.
    pub fn purge_completed_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.checked_sub_signed(max_age);
        let completed = match cutoff {
            Some(_) => self.list(&ListQuery::status(TaskStatus::Completed))?,
            None => Vec::new(),
        };

        let mut purged = 0;
        {
            let _guard = self.lock();
            for candidate in completed {
                // Re-read under the lock so a concurrent delete is not an error
                let Some(task) = self.load(&candidate.id)? else {
                    continue;
                };
                if task.status != TaskStatus::Completed {
                    continue;
                }
                let finished = task.completed_at.unwrap_or(task.updated_at);
                if cutoff.is_none_or(|cutoff| finished >= cutoff) {
                    continue;
                }
                self.remove(&task)?;
                debug!(task_id = %task.id, "Purged completed task");
                purged += 1;
            }

            self.metadata.insert(
                encode_meta_key(META_LAST_PURGE),
                now.timestamp_micros().to_string().as_bytes(),
            )?;
        }

        self.persist()?;
        info!("Purged {} completed tasks older than {} days", purged, max_age.num_days());
        Ok(purged)
    }

    /// Time of the last purge run, if any
    pub fn last_purge(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(value) = self.metadata.get(encode_meta_key(META_LAST_PURGE))? else {
            return Ok(None);
        };
        Ok(std::str::from_utf8(&value)
            .ok()
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, TaskRecord};
    use tempfile::TempDir;

    fn completed_task(store: &TaskStore, name: &str, finished: DateTime<Utc>) -> TaskRecord {
        let request = NewTask::builder()
            .source_url(format!("https://archive.example.org/{name}"))
            .destination_path("/tmp/downloads")
            .file_name(name)
            .total_bytes(10)
            .build();
        let task = TaskRecord::new(request, finished);
        store.put(&task).unwrap();
        store.claim(&task.id, finished).unwrap();
        store
            .update(&task.id, &[TaskStatus::Running], |t| {
                t.record_progress(10, finished)?;
                t.complete(finished)?;
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_purge_removes_only_old_completed_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let store = TaskStore::open(temp_dir.path().join("tasks")).unwrap();
        let now = Utc::now();

        let old = completed_task(&store, "old.bin", now - Duration::days(40));
        let fresh = completed_task(&store, "fresh.bin", now - Duration::days(2));
        let queued = TaskRecord::new(
            NewTask::builder()
                .source_url("https://archive.example.org/q")
                .destination_path("/tmp")
                .file_name("q")
                .build(),
            now - Duration::days(90),
        );
        store.put(&queued).unwrap();

        assert!(store.last_purge().unwrap().is_none());
        let purged = store
            .purge_completed_older_than(Duration::days(RETENTION_COMPLETED_DAYS), now)
            .unwrap();

        assert_eq!(purged, 1);
        assert!(store.get(&old.id).is_err());
        assert!(store.get(&fresh.id).is_ok());
        assert!(store.get(&queued.id).is_ok());
        assert!(store.last_purge().unwrap().is_some());
    }

    #[test]
    fn test_purge_with_unrepresentable_age_keeps_everything() {
        let temp_dir = TempDir::new().unwrap();
        let store = TaskStore::open(temp_dir.path().join("tasks")).unwrap();
        let now = Utc::now();
        let old = completed_task(&store, "old.bin", now - Duration::days(400));

        let purged = store
            .purge_completed_older_than(Duration::days(i64::from(u32::MAX)), now)
            .unwrap();

        assert_eq!(purged, 0);
        assert!(store.get(&old.id).is_ok());
        assert!(store.last_purge().unwrap().is_some());
    }
}
