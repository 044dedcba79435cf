/// Key layout and encoding utilities for Fjall partitions
///
/// Partition structure:
/// - `tasks`: task:{id} -> TaskRecord (JSON)
/// - `by_status`: {status}:{rank}:{created_us:020}:{id} -> empty
/// - `by_order`: {rank}:{created_us:020}:{id} -> empty
/// - `by_schedule`: {scheduled_us:020}:{id} -> empty (queued tasks with a start time)
/// - `by_identifier`: {identifier}\0{id} -> empty
/// - `metadata`: meta:{key} -> value
///
/// `rank` is the inverted priority (high = 0), so a forward scan of
/// `by_status` or `by_order` yields priority descending, then creation time
/// ascending, with the time-ordered id as the final tie-break.
use chrono::{DateTime, Utc};

use crate::task::{TaskRecord, TaskStatus};

pub const TASKS: &str = "tasks";
pub const BY_STATUS: &str = "by_status";
pub const BY_ORDER: &str = "by_order";
pub const BY_SCHEDULE: &str = "by_schedule";
pub const BY_IDENTIFIER: &str = "by_identifier";
pub const METADATA: &str = "metadata";

pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_LAST_PURGE: &str = "last_purge";

fn sortable_micros(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_micros().max(0) as u64
}

/// Encode a task key: task:{id}
pub fn encode_task_key(id: &str) -> Vec<u8> {
    format!("task:{}", id).into_bytes()
}

/// Decode a task key: task:{id} -> id
pub fn decode_task_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix("task:").map(String::from)
}

/// Prefix covering every task with the given status, in dispatch order
pub fn encode_status_prefix(status: TaskStatus) -> Vec<u8> {
    format!("{}:", status.as_str()).into_bytes()
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}

/// Prefix covering every task of one content item
pub fn encode_identifier_prefix(identifier: &str) -> Vec<u8> {
    let mut key = identifier.as_bytes().to_vec();
    key.push(0);
    key
}

/// Extract the task id from any secondary index key
pub fn decode_index_id(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str
        .rsplit(|c| c == ':' || c == '\0')
        .next()
        .filter(|id| !id.is_empty())
        .map(String::from)
}

/// Decode a schedule key: {scheduled_us:020}:{id} -> (scheduled_us, id)
pub fn decode_schedule_key(key: &[u8]) -> Option<(u64, String)> {
    let key_str = std::str::from_utf8(key).ok()?;
    let (micros, id) = key_str.split_once(':')?;
    Some((micros.parse().ok()?, id.to_string()))
}

/// Micro-second timestamp back to a `DateTime`
pub fn micros_to_datetime(micros: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(i64::try_from(micros).ok()?)
}

/// Every secondary index entry a task record owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntries {
    pub status: Vec<u8>,
    pub order: Vec<u8>,
    pub schedule: Option<Vec<u8>>,
    pub identifier: Vec<u8>,
}

impl IndexEntries {
    pub fn for_task(task: &TaskRecord) -> Self {
        let rank = task.priority.rank();
        let created = sortable_micros(task.created_at);

        let status = format!("{}:{}:{:020}:{}", task.status.as_str(), rank, created, task.id);
        let order = format!("{}:{:020}:{}", rank, created, task.id);
        let schedule = match (task.status, task.scheduled_time) {
            (TaskStatus::Queued, Some(at)) => {
                Some(format!("{:020}:{}", sortable_micros(at), task.id).into_bytes())
            }
            _ => None,
        };

        let mut identifier = encode_identifier_prefix(&task.content_id);
        identifier.extend_from_slice(task.id.as_bytes());

        Self {
            status: status.into_bytes(),
            order: order.into_bytes(),
            schedule,
            identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, Priority};
    use chrono::TimeZone;

    fn task(priority: Priority, created_secs: i64) -> TaskRecord {
        let request = NewTask::builder()
            .source_url("https://example.com/f")
            .destination_path("/tmp")
            .file_name("f")
            .content_id("item:42")
            .priority(priority)
            .build();
        TaskRecord::new(request, Utc.timestamp_opt(created_secs, 0).unwrap())
    }

    #[test]
    fn test_task_key_encoding() {
        let key = encode_task_key("abc");
        assert_eq!(key, b"task:abc");
        assert_eq!(decode_task_key(&key).unwrap(), "abc");
    }

    #[test]
    fn test_status_keys_sort_in_dispatch_order() {
        let old_low = IndexEntries::for_task(&task(Priority::Low, 100));
        let new_high = IndexEntries::for_task(&task(Priority::High, 300));
        let old_normal = IndexEntries::for_task(&task(Priority::Normal, 100));
        let new_normal = IndexEntries::for_task(&task(Priority::Normal, 200));

        let mut keys = vec![
            old_low.status.clone(),
            new_normal.status.clone(),
            new_high.status.clone(),
            old_normal.status.clone(),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![new_high.status, old_normal.status, new_normal.status, old_low.status]
        );
    }

    #[test]
    fn test_status_prefix_matches() {
        let entries = IndexEntries::for_task(&task(Priority::Normal, 1));
        assert!(entries.status.starts_with(&encode_status_prefix(TaskStatus::Queued)));
        assert!(!entries.status.starts_with(&encode_status_prefix(TaskStatus::Running)));
    }

    #[test]
    fn test_index_id_decoding() {
        let t = task(Priority::High, 5);
        let entries = IndexEntries::for_task(&t);
        assert_eq!(decode_index_id(&entries.status).unwrap(), t.id);
        assert_eq!(decode_index_id(&entries.order).unwrap(), t.id);
        // identifier contains ':' itself
        assert_eq!(decode_index_id(&entries.identifier).unwrap(), t.id);
        assert!(entries.identifier.starts_with(&encode_identifier_prefix("item:42")));
    }

    #[test]
    fn test_schedule_key_only_for_deferred_queued_tasks() {
        let mut t = task(Priority::Normal, 5);
        assert!(IndexEntries::for_task(&t).schedule.is_none());

        t.scheduled_time = Some(Utc.timestamp_opt(1_000, 0).unwrap());
        let key = IndexEntries::for_task(&t).schedule.unwrap();
        let (micros, id) = decode_schedule_key(&key).unwrap();
        assert_eq!(micros, 1_000_000_000);
        assert_eq!(id, t.id);
        assert_eq!(micros_to_datetime(micros), t.scheduled_time);

        t.status = TaskStatus::Paused;
        assert!(IndexEntries::for_task(&t).schedule.is_none());
    }

    #[test]
    fn test_meta_key_encoding() {
        assert_eq!(encode_meta_key("schema_version"), b"meta:schema_version");
    }
}
