use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use super::state::{TaskStateError, TaskStatus};

type Result<T> = std::result::Result<T, TaskStateError>;

/// Scheduling priority. Higher priorities are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Sort rank for index keys: `0` sorts first and is the highest priority.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Current link type as reported by the platform network observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Offline,
    Metered,
    Unmetered,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkType::Offline => "offline",
            LinkType::Metered => "metered",
            LinkType::Unmetered => "unmetered",
        })
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offline" | "none" => Ok(LinkType::Offline),
            "metered" | "cellular" => Ok(LinkType::Metered),
            "unmetered" | "wifi" => Ok(LinkType::Unmetered),
            other => Err(format!("unknown link type '{other}'")),
        }
    }
}

/// Link type a task needs before it may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkRequirement {
    #[default]
    Any,
    Unmetered,
}

impl NetworkRequirement {
    pub fn is_satisfied_by(self, link: LinkType) -> bool {
        match (self, link) {
            (_, LinkType::Offline) => false,
            (NetworkRequirement::Any, _) => true,
            (NetworkRequirement::Unmetered, LinkType::Unmetered) => true,
            (NetworkRequirement::Unmetered, LinkType::Metered) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkRequirement::Any => "any",
            NetworkRequirement::Unmetered => "unmetered",
        }
    }
}

impl FromStr for NetworkRequirement {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(NetworkRequirement::Any),
            "unmetered" | "unmetered-only" | "wifi" => Ok(NetworkRequirement::Unmetered),
            other => Err(format!("unknown network requirement '{other}'")),
        }
    }
}

/// Why a task left `running` for `paused`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    /// Explicit pause by id. The task stays `paused` until resumed.
    User,
    /// The task's network requirement stopped being met. The scheduler
    /// requeues it once the link satisfies the requirement again.
    Network,
    /// The manager is shutting down
    Shutdown,
}

impl PauseReason {
    /// Shutdown pauses go straight back to the queue so the next start
    /// picks the task up again.
    pub fn requeues(self) -> bool {
        matches!(self, PauseReason::Shutdown)
    }
}

/// Remote validators captured on first contact and checked on resume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Value for an `If-Range` header. Strong entity tags win over dates.
    pub fn if_range(&self) -> Option<&str> {
        self.etag
            .as_deref()
            .filter(|tag| !tag.starts_with("W/"))
            .or(self.last_modified.as_deref())
    }

    /// True when `other` describes a different representation than `self`.
    /// Only validators present on both sides are compared.
    pub fn conflicts_with(&self, other: &Validators) -> bool {
        let etag_differs = matches!(
            (&self.etag, &other.etag),
            (Some(a), Some(b)) if a != b
        );
        let date_differs = matches!(
            (&self.last_modified, &other.last_modified),
            (Some(a), Some(b)) if a != b
        );
        etag_differs || date_differs
    }
}

/// Request to create a task
#[derive(Debug, Clone, Builder)]
pub struct NewTask {
    #[builder(into)]
    pub source_url: String,
    #[builder(into)]
    pub destination_path: PathBuf,
    #[builder(into)]
    pub file_name: String,
    #[builder(into, default)]
    pub content_id: String,
    #[builder(default)]
    pub priority: Priority,
    #[builder(default)]
    pub network_requirement: NetworkRequirement,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub total_bytes: Option<u64>,
    pub metadata: Option<Value>,
    pub selected_files: Option<Value>,
}

/// Coarse, display-oriented view of a task's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Waiting,
    Retrying,
    Active,
    Paused,
    Done,
    Failed,
    Cancelled,
}

/// Durable description of one file transfer.
///
/// Serialized field names follow the `download_tasks` column names so the
/// persisted layout stays stable across schema versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(rename = "identifier")]
    pub content_id: String,
    #[serde(rename = "url")]
    pub source_url: String,
    #[serde(rename = "save_path")]
    pub destination_path: PathBuf,
    pub file_name: String,
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub partial_bytes: u64,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub network_requirement: NetworkRequirement,
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub scheduled_time: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub selected_files: Option<Value>,
}

impl TaskRecord {
    /// Create a queued record with a fresh time-ordered id
    pub fn new(request: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            content_id: request.content_id,
            source_url: request.source_url,
            destination_path: request.destination_path,
            file_name: request.file_name,
            total_bytes: request.total_bytes,
            partial_bytes: 0,
            etag: None,
            last_modified: None,
            priority: request.priority,
            network_requirement: request.network_requirement,
            scheduled_time: request.scheduled_time,
            status: TaskStatus::Queued,
            pause_reason: None,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            metadata: request.metadata,
            selected_files: request.selected_files,
        }
    }

    /// Full local path the transfer writes to
    pub fn destination_file(&self) -> PathBuf {
        self.destination_path.join(&self.file_name)
    }

    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }

    pub fn progress(&self) -> f64 {
        match self.total_bytes {
            Some(0) | None => 0.0,
            Some(total) => (self.partial_bytes as f64 / total as f64) * 100.0,
        }
    }

    pub fn phase(&self) -> TaskPhase {
        match self.status {
            TaskStatus::Queued if self.error_message.is_some() => TaskPhase::Retrying,
            TaskStatus::Queued => TaskPhase::Waiting,
            TaskStatus::Running => TaskPhase::Active,
            TaskStatus::Paused => TaskPhase::Paused,
            TaskStatus::Completed => TaskPhase::Done,
            TaskStatus::Failed => TaskPhase::Failed,
            TaskStatus::Cancelled => TaskPhase::Cancelled,
        }
    }

    fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(TaskStateError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.pause_reason = None;
        self.updated_at = now;
        Ok(())
    }

    /// `queued -> running`
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Running, now)?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    /// `running -> paused`, progress kept as-is
    pub fn pause(&mut self, reason: PauseReason, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Paused, now)?;
        self.pause_reason = Some(reason);
        Ok(())
    }

    /// Paused because the link stopped meeting the requirement, which
    /// `link` now satisfies again
    pub fn network_restored(&self, link: LinkType) -> bool {
        self.status == TaskStatus::Paused
            && self.pause_reason == Some(PauseReason::Network)
            && self.network_requirement.is_satisfied_by(link)
    }

    /// `paused | failed -> queued` without touching the retry counter
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Queued, now)?;
        self.scheduled_time = None;
        Ok(())
    }

    /// `running -> failed`
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Failed, now)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// `failed -> queued` on behalf of the retry policy
    pub fn retry_at(&mut self, not_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Queued, now)?;
        self.retry_count += 1;
        self.scheduled_time = Some(not_before);
        Ok(())
    }

    /// `running -> completed`, only with every byte on disk
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.total_bytes != Some(self.partial_bytes) {
            return Err(TaskStateError::Incomplete {
                partial: self.partial_bytes,
                total: self.total_bytes,
            });
        }
        self.transition(TaskStatus::Completed, now)?;
        self.completed_at = Some(now);
        self.error_message = None;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Cancelled, now)
    }

    /// Advance the persisted offset. Never moves backwards.
    pub fn record_progress(&mut self, partial: u64, now: DateTime<Utc>) -> Result<()> {
        if partial < self.partial_bytes {
            return Err(TaskStateError::ProgressRegression {
                current: self.partial_bytes,
                requested: partial,
            });
        }
        if let Some(total) = self.total_bytes {
            if partial > total {
                return Err(TaskStateError::ProgressOverflow { partial, total });
            }
        }
        self.partial_bytes = partial;
        self.updated_at = now;
        Ok(())
    }

    /// Restart from byte zero with the validators of the new representation
    pub fn reset_progress(
        &mut self,
        validators: Validators,
        total_bytes: Option<u64>,
        now: DateTime<Utc>,
    ) {
        self.partial_bytes = 0;
        self.etag = validators.etag;
        self.last_modified = validators.last_modified;
        self.total_bytes = total_bytes;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task() -> TaskRecord {
        let request = NewTask::builder()
            .source_url("https://archive.example.org/items/a/file.bin")
            .destination_path("/tmp/downloads")
            .file_name("file.bin")
            .content_id("item-a")
            .total_bytes(1000)
            .build();
        TaskRecord::new(request, Utc::now())
    }

    #[test]
    fn test_new_task_defaults() {
        let task = new_task();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.network_requirement, NetworkRequirement::Any);
        assert_eq!(task.partial_bytes, 0);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.destination_file(), PathBuf::from("/tmp/downloads/file.bin"));
    }

    #[test]
    fn test_start_sets_started_at_once() {
        let mut task = new_task();
        let first = Utc::now();
        task.start(first).unwrap();
        task.pause(PauseReason::User, first).unwrap();
        task.requeue(first).unwrap();
        task.start(first + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(task.started_at, Some(first));
    }

    #[test]
    fn test_complete_requires_all_bytes() {
        let mut task = new_task();
        let now = Utc::now();
        task.start(now).unwrap();
        task.record_progress(999, now).unwrap();

        let err = task.complete(now).unwrap_err();
        assert!(matches!(err, TaskStateError::Incomplete { partial: 999, .. }));
        assert_eq!(task.status, TaskStatus::Running);

        task.record_progress(1000, now).unwrap();
        task.complete(now).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_progress_is_monotonic_and_bounded() {
        let mut task = new_task();
        let now = Utc::now();
        task.record_progress(400, now).unwrap();
        assert!(matches!(
            task.record_progress(300, now),
            Err(TaskStateError::ProgressRegression { .. })
        ));
        assert!(matches!(
            task.record_progress(1001, now),
            Err(TaskStateError::ProgressOverflow { .. })
        ));

        task.reset_progress(Validators::default(), Some(1200), now);
        assert_eq!(task.partial_bytes, 0);
        assert_eq!(task.total_bytes, Some(1200));
    }

    #[test]
    fn test_retry_increments_counter_and_defers() {
        let mut task = new_task();
        let now = Utc::now();
        task.start(now).unwrap();
        task.fail("connection reset", now).unwrap();
        let later = now + chrono::Duration::seconds(30);
        task.retry_at(later, now).unwrap();

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.scheduled_time, Some(later));
        assert_eq!(task.phase(), TaskPhase::Retrying);
    }

    #[test]
    fn test_pause_reason_is_kept_only_while_paused() {
        let mut task = new_task();
        task.network_requirement = NetworkRequirement::Unmetered;
        let now = Utc::now();
        task.start(now).unwrap();
        task.pause(PauseReason::Network, now).unwrap();
        assert_eq!(task.pause_reason, Some(PauseReason::Network));
        assert!(!task.network_restored(LinkType::Metered));
        assert!(task.network_restored(LinkType::Unmetered));

        task.requeue(now).unwrap();
        assert_eq!(task.pause_reason, None);
        assert!(!task.network_restored(LinkType::Unmetered));

        task.start(now).unwrap();
        task.pause(PauseReason::User, now).unwrap();
        assert!(!task.network_restored(LinkType::Unmetered));
    }

    #[test]
    fn test_cancel_is_terminal() {
        let mut task = new_task();
        let now = Utc::now();
        task.cancel(now).unwrap();
        assert!(task.start(now).is_err());
        assert!(task.requeue(now).is_err());
    }

    #[test]
    fn test_network_requirement() {
        assert!(NetworkRequirement::Any.is_satisfied_by(LinkType::Metered));
        assert!(!NetworkRequirement::Any.is_satisfied_by(LinkType::Offline));
        assert!(!NetworkRequirement::Unmetered.is_satisfied_by(LinkType::Metered));
        assert!(NetworkRequirement::Unmetered.is_satisfied_by(LinkType::Unmetered));
    }

    #[test]
    fn test_validators() {
        let stored = Validators {
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Tue, 01 Oct 2024 10:00:00 GMT".to_string()),
        };
        assert_eq!(stored.if_range(), Some("\"v1\""));

        let changed = Validators {
            etag: Some("\"v2\"".to_string()),
            last_modified: None,
        };
        assert!(stored.conflicts_with(&changed));
        assert!(!stored.conflicts_with(&Validators::default()));

        let weak = Validators {
            etag: Some("W/\"v1\"".to_string()),
            last_modified: Some("Tue, 01 Oct 2024 10:00:00 GMT".to_string()),
        };
        assert_eq!(weak.if_range(), Some("Tue, 01 Oct 2024 10:00:00 GMT"));
    }

    #[test]
    fn test_serialized_column_names() {
        let task = new_task();
        let value = serde_json::to_value(&task).unwrap();
        for column in [
            "id",
            "identifier",
            "url",
            "save_path",
            "file_name",
            "total_bytes",
            "status",
            "created_at",
            "updated_at",
            "partial_bytes",
            "priority",
            "network_requirement",
            "retry_count",
        ] {
            assert!(value.get(column).is_some(), "missing column {column}");
        }
        assert_eq!(value["status"], "queued");
        assert_eq!(value["network_requirement"], "any");
    }
}
