use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::task::{PauseReason, TaskRecord, TaskStatus};

use super::error::{Result, StoreError};
use super::partitions::{
    self, decode_index_id, decode_schedule_key, encode_identifier_prefix, encode_status_prefix,
    encode_task_key, micros_to_datetime, IndexEntries,
};

/// Filter and limit for [`TaskStore::list`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Fjall-backed durable store for task records
///
/// Every mutating call commits one atomic batch (record plus its index
/// entries) and syncs the journal before returning. Read-modify-write
/// operations are serialized through an internal lock, which is what makes
/// [`TaskStore::claim`] a compare-and-set on the stored status.
pub struct TaskStore {
    pub(super) keyspace: Keyspace,
    pub(super) tasks: PartitionHandle,
    pub(super) by_status: PartitionHandle,
    pub(super) by_order: PartitionHandle,
    pub(super) by_schedule: PartitionHandle,
    pub(super) by_identifier: PartitionHandle,
    pub(super) metadata: PartitionHandle,
    write_lock: Mutex<()>,
}

impl TaskStore {
    /// Open or create a store at the given path, applying pending migrations
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening task store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let tasks = keyspace.open_partition(partitions::TASKS, PartitionCreateOptions::default())?;
        let by_status =
            keyspace.open_partition(partitions::BY_STATUS, PartitionCreateOptions::default())?;
        let by_order =
            keyspace.open_partition(partitions::BY_ORDER, PartitionCreateOptions::default())?;
        let by_schedule =
            keyspace.open_partition(partitions::BY_SCHEDULE, PartitionCreateOptions::default())?;
        let by_identifier =
            keyspace.open_partition(partitions::BY_IDENTIFIER, PartitionCreateOptions::default())?;
        let metadata =
            keyspace.open_partition(partitions::METADATA, PartitionCreateOptions::default())?;

        let store = Self {
            keyspace,
            tasks,
            by_status,
            by_order,
            by_schedule,
            by_identifier,
            metadata,
            write_lock: Mutex::new(()),
        };

        store.migrate()?;

        info!(
            schema_version = store.schema_version()?,
            "Task store opened successfully"
        );
        Ok(store)
    }

    /// Insert or replace a record by id
    pub fn put(&self, task: &TaskRecord) -> Result<()> {
        let _guard = self.lock();
        let previous = self.load(&task.id)?;
        self.write(previous.as_ref(), task)?;
        debug!(task_id = %task.id, status = %task.status, "Upserted task");
        Ok(())
    }

    /// Get a record by id
    pub fn get(&self, id: &str) -> Result<TaskRecord> {
        self.load(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// List records in dispatch order (priority desc, created_at asc)
    pub fn list(&self, query: &ListQuery) -> Result<Vec<TaskRecord>> {
        match query.status {
            Some(status) => {
                self.resolve_entries(self.by_status.prefix(encode_status_prefix(status)), query)
            }
            None => self.resolve_entries(self.by_order.iter(), query),
        }
    }

    /// Same contract as [`TaskStore::list`], computed from a full scan of
    /// the records without touching the secondary indexes
    pub fn scan(&self, query: &ListQuery) -> Result<Vec<TaskRecord>> {
        let mut results = Vec::new();
        for item in self.tasks.iter() {
            let (_, value) = item?;
            let task: TaskRecord = serde_json::from_slice(&value)?;
            if query.status.is_none_or(|status| status == task.status) {
                results.push(task);
            }
        }

        results.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// All tasks belonging to one content item, in creation order
    pub fn list_by_content(&self, identifier: &str) -> Result<Vec<TaskRecord>> {
        let mut results = Vec::new();
        for item in self.by_identifier.prefix(encode_identifier_prefix(identifier)) {
            let (key, _) = item?;
            if let Some(task) = self.resolve_index_key(key.as_ref())? {
                results.push(task);
            }
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    /// Delete a record and its index entries
    pub fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock();
        let task = self
            .load(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.remove(&task)?;
        debug!(task_id = %id, "Deleted task");
        Ok(())
    }

    /// Atomically apply `mutate` to a record whose stored status is one of
    /// `expected` (any status if `expected` is empty)
    pub fn update<F>(&self, id: &str, expected: &[TaskStatus], mutate: F) -> Result<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord) -> Result<()>,
    {
        let _guard = self.lock();
        let previous = self
            .load(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !expected.is_empty() && !expected.contains(&previous.status) {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected.to_vec(),
                actual: previous.status,
            });
        }

        let mut task = previous.clone();
        mutate(&mut task)?;
        self.write(Some(&previous), &task)?;
        Ok(task)
    }

    /// Claim a task for execution: `queued -> running` only if the stored
    /// status is still `queued`
    pub fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<TaskRecord> {
        let task = self.update(id, &[TaskStatus::Queued], |task| {
            task.start(now)?;
            Ok(())
        })?;
        debug!(task_id = %id, "Claimed task");
        Ok(task)
    }

    /// Persist a new resume offset for a running task
    pub fn record_progress(&self, id: &str, partial: u64, now: DateTime<Utc>) -> Result<TaskRecord> {
        self.update(id, &[TaskStatus::Running], |task| {
            task.record_progress(partial, now)?;
            Ok(())
        })
    }

    /// Return tasks left `running` by a previous process to the queue,
    /// keeping their resume offsets
    pub fn reconcile_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let running = self.list(&ListQuery::status(TaskStatus::Running))?;
        let mut recovered = Vec::with_capacity(running.len());

        for task in running {
            let result = self.update(&task.id, &[TaskStatus::Running], |task| {
                task.pause(PauseReason::Shutdown, now)?;
                task.requeue(now)?;
                Ok(())
            });
            match result {
                Ok(task) => {
                    info!(
                        task_id = %task.id,
                        partial_bytes = task.partial_bytes,
                        "Requeued interrupted task"
                    );
                    recovered.push(task.id);
                }
                Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }

    /// Earliest start time of a deferred queued task strictly after `now`
    pub fn next_scheduled_after(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let lower = format!("{:020}", now.timestamp_micros().max(0) as u64 + 1).into_bytes();
        for item in self.by_schedule.range(lower..) {
            let (key, _) = item?;
            if let Some((micros, _)) = decode_schedule_key(key.as_ref()) {
                return Ok(micros_to_datetime(micros));
            }
        }
        Ok(None)
    }

    /// Task counts per status
    pub fn stats(&self) -> Result<StoreStats> {
        let mut counts = HashMap::new();
        for status in TaskStatus::ALL {
            let mut count = 0;
            for item in self.by_status.prefix(encode_status_prefix(status)) {
                item?;
                count += 1;
            }
            counts.insert(status, count);
        }
        Ok(StoreStats { counts })
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Flush and release the store handle
    pub fn close(self) -> Result<()> {
        self.persist()?;
        info!("Task store closed");
        Ok(())
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn load(&self, id: &str) -> Result<Option<TaskRecord>> {
        match self.tasks.get(encode_task_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn resolve_index_key(&self, key: &[u8]) -> Result<Option<TaskRecord>> {
        let Some(id) = decode_index_id(key) else {
            warn!(key = %String::from_utf8_lossy(key), "Skipping malformed index key");
            return Ok(None);
        };
        let task = self.load(&id)?;
        if task.is_none() {
            warn!(task_id = %id, "Index entry points at a missing task");
        }
        Ok(task)
    }

    fn resolve_entries<I, K, V>(&self, entries: I, query: &ListQuery) -> Result<Vec<TaskRecord>>
    where
        I: Iterator<Item = std::result::Result<(K, V), fjall::Error>>,
        K: AsRef<[u8]>,
    {
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();

        for item in entries {
            if results.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let Some(task) = self.resolve_index_key(key.as_ref())? else {
                continue;
            };
            // A concurrent writer may have moved the record since the index
            // entry was read.
            if query.status.is_some_and(|status| status != task.status) {
                continue;
            }
            results.push(task);
        }

        Ok(results)
    }

    /// Write `task` and move its index entries away from `previous`.
    /// Caller holds the write lock.
    pub(super) fn write(&self, previous: Option<&TaskRecord>, task: &TaskRecord) -> Result<()> {
        let next = IndexEntries::for_task(task);
        let mut batch = self.keyspace.batch();

        if let Some(previous) = previous {
            let old = IndexEntries::for_task(previous);
            if old.status != next.status {
                batch.remove(&self.by_status, old.status);
            }
            if old.order != next.order {
                batch.remove(&self.by_order, old.order);
            }
            if old.identifier != next.identifier {
                batch.remove(&self.by_identifier, old.identifier);
            }
            if let Some(schedule) = old.schedule {
                if next.schedule.as_ref() != Some(&schedule) {
                    batch.remove(&self.by_schedule, schedule);
                }
            }
        }

        batch.insert(&self.by_status, next.status, Vec::<u8>::new());
        batch.insert(&self.by_order, next.order, Vec::<u8>::new());
        batch.insert(&self.by_identifier, next.identifier, Vec::<u8>::new());
        if let Some(schedule) = next.schedule {
            batch.insert(&self.by_schedule, schedule, Vec::<u8>::new());
        }
        batch.insert(&self.tasks, encode_task_key(&task.id), serde_json::to_vec(task)?);

        batch.commit()?;
        self.persist()
    }

    /// Remove `task` and all of its index entries. Caller holds the write lock.
    pub(super) fn remove(&self, task: &TaskRecord) -> Result<()> {
        let entries = IndexEntries::for_task(task);
        let mut batch = self.keyspace.batch();
        batch.remove(&self.by_status, entries.status);
        batch.remove(&self.by_order, entries.order);
        batch.remove(&self.by_identifier, entries.identifier);
        if let Some(schedule) = entries.schedule {
            batch.remove(&self.by_schedule, schedule);
        }
        batch.remove(&self.tasks, encode_task_key(&task.id));
        batch.commit()?;
        self.persist()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub counts: HashMap<TaskStatus, usize>,
}

impl StoreStats {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, Priority};
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (TaskStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = TaskStore::open(temp_dir.path().join("tasks")).unwrap();
        (store, temp_dir)
    }

    fn create_test_task(name: &str, priority: Priority, created_secs: i64) -> TaskRecord {
        let request = NewTask::builder()
            .source_url(format!("https://archive.example.org/{name}"))
            .destination_path("/tmp/downloads")
            .file_name(name)
            .content_id("item-1")
            .priority(priority)
            .total_bytes(1000)
            .build();
        TaskRecord::new(request, Utc.timestamp_opt(1_700_000_000 + created_secs, 0).unwrap())
    }

    #[test]
    fn test_put_and_get() {
        let (store, _temp) = create_test_store();
        let task = create_test_task("a.bin", Priority::Normal, 0);

        store.put(&task).unwrap();
        let retrieved = store.get(&task.id).unwrap();
        assert_eq!(retrieved, task);

        // put is idempotent
        store.put(&task).unwrap();
        assert_eq!(store.list(&ListQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_get_nonexistent_task() {
        let (store, _temp) = create_test_store();
        assert!(matches!(store.get("missing"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_orders_by_priority_then_creation() {
        let (store, _temp) = create_test_store();
        let low = create_test_task("low", Priority::Low, 0);
        let normal_old = create_test_task("normal-old", Priority::Normal, 1);
        let high = create_test_task("high", Priority::High, 5);
        let normal_new = create_test_task("normal-new", Priority::Normal, 3);

        for task in [&normal_new, &low, &high, &normal_old] {
            store.put(task).unwrap();
        }

        let names: Vec<String> = store
            .list(&ListQuery::status(TaskStatus::Queued))
            .unwrap()
            .into_iter()
            .map(|t| t.file_name)
            .collect();
        assert_eq!(names, vec!["high", "normal-old", "normal-new", "low"]);

        let limited = store.list(&ListQuery::default().with_limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].file_name, "high");
    }

    #[test]
    fn test_index_listing_matches_full_scan() {
        let (store, _temp) = create_test_store();
        let priorities = [Priority::Low, Priority::High, Priority::Normal];
        for i in 0..12 {
            let mut task = create_test_task(&format!("f{i}"), priorities[i % 3], (i as i64 * 7) % 5);
            if i % 4 == 0 {
                task.start(Utc::now()).unwrap();
            }
            store.put(&task).unwrap();
        }

        for query in [
            ListQuery::default(),
            ListQuery::status(TaskStatus::Queued),
            ListQuery::status(TaskStatus::Running),
            ListQuery::status(TaskStatus::Queued).with_limit(3),
        ] {
            assert_eq!(store.list(&query).unwrap(), store.scan(&query).unwrap());
        }
    }

    #[test]
    fn test_status_change_moves_index_entry() {
        let (store, _temp) = create_test_store();
        let task = create_test_task("a.bin", Priority::Normal, 0);
        store.put(&task).unwrap();

        store.claim(&task.id, Utc::now()).unwrap();

        assert!(store.list(&ListQuery::status(TaskStatus::Queued)).unwrap().is_empty());
        let running = store.list(&ListQuery::status(TaskStatus::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert!(running[0].started_at.is_some());

        let stats = store.stats().unwrap();
        assert_eq!(stats.count(TaskStatus::Running), 1);
        assert_eq!(stats.total(), 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (store, _temp) = create_test_store();
        let store = Arc::new(store);
        let task = create_test_task("contended.bin", Priority::High, 0);
        store.put(&task).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = task.id.clone();
                std::thread::spawn(move || store.claim(&id, Utc::now()).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        assert!(matches!(
            store.claim(&task.id, Utc::now()),
            Err(StoreError::Conflict { actual: TaskStatus::Running, .. })
        ));
    }

    #[test]
    fn test_record_progress_requires_running() {
        let (store, _temp) = create_test_store();
        let task = create_test_task("a.bin", Priority::Normal, 0);
        store.put(&task).unwrap();

        assert!(matches!(
            store.record_progress(&task.id, 10, Utc::now()),
            Err(StoreError::Conflict { .. })
        ));

        store.claim(&task.id, Utc::now()).unwrap();
        store.record_progress(&task.id, 400, Utc::now()).unwrap();
        assert!(matches!(
            store.record_progress(&task.id, 100, Utc::now()),
            Err(StoreError::Transition(_))
        ));
        assert_eq!(store.get(&task.id).unwrap().partial_bytes, 400);
    }

    #[test]
    fn test_delete_removes_indexes() {
        let (store, _temp) = create_test_store();
        let task = create_test_task("a.bin", Priority::Normal, 0);
        store.put(&task).unwrap();

        store.delete(&task.id).unwrap();
        assert!(store.list(&ListQuery::default()).unwrap().is_empty());
        assert!(store.list_by_content("item-1").unwrap().is_empty());
        assert_eq!(store.stats().unwrap().total(), 0);
    }

    #[test]
    fn test_list_by_content() {
        let (store, _temp) = create_test_store();
        let first = create_test_task("part1", Priority::Low, 0);
        let second = create_test_task("part2", Priority::High, 1);
        let mut other = create_test_task("other", Priority::Normal, 2);
        other.content_id = "item-2".to_string();
        for task in [&second, &other, &first] {
            store.put(task).unwrap();
        }

        let names: Vec<String> = store
            .list_by_content("item-1")
            .unwrap()
            .into_iter()
            .map(|t| t.file_name)
            .collect();
        assert_eq!(names, vec!["part1", "part2"]);
    }

    #[test]
    fn test_next_scheduled_after() {
        let (store, _temp) = create_test_store();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut later = create_test_task("later", Priority::Normal, 0);
        later.scheduled_time = Some(now + chrono::Duration::minutes(10));
        let mut sooner = create_test_task("sooner", Priority::Normal, 1);
        sooner.scheduled_time = Some(now + chrono::Duration::minutes(2));
        let mut past = create_test_task("past", Priority::Normal, 2);
        past.scheduled_time = Some(now - chrono::Duration::minutes(2));

        for task in [&later, &sooner, &past] {
            store.put(task).unwrap();
        }

        assert_eq!(store.next_scheduled_after(now).unwrap(), sooner.scheduled_time);

        store.claim(&sooner.id, now).unwrap();
        assert_eq!(store.next_scheduled_after(now).unwrap(), later.scheduled_time);
    }

    #[test]
    fn test_reconcile_interrupted() {
        let (store, _temp) = create_test_store();
        let task = create_test_task("a.bin", Priority::Normal, 0);
        store.put(&task).unwrap();
        store.claim(&task.id, Utc::now()).unwrap();
        store.record_progress(&task.id, 400, Utc::now()).unwrap();

        let recovered = store.reconcile_interrupted(Utc::now()).unwrap();
        assert_eq!(recovered, vec![task.id.clone()]);

        let task = store.get(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.partial_bytes, 400);
    }

    #[test]
    fn test_persistence_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks");

        let task = create_test_task("durable.bin", Priority::High, 0);
        {
            let store = TaskStore::open(&path).unwrap();
            store.put(&task).unwrap();
            store.claim(&task.id, Utc::now()).unwrap();
            store.record_progress(&task.id, 400, Utc::now()).unwrap();
            store.close().unwrap();
        }

        let store = TaskStore::open(&path).unwrap();
        let reopened = store.get(&task.id).unwrap();
        assert_eq!(reopened.status, TaskStatus::Running);
        assert_eq!(reopened.partial_bytes, 400);
        assert_eq!(
            store.list(&ListQuery::status(TaskStatus::Running)).unwrap().len(),
            1
        );
    }
}
