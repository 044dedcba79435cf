//! Request and response bodies of the control API.
//!
//! A task submission (`POST /tasks`) looks like:
//!
//! ```json
//! {
//!   "url": "https://archive.example.org/lectures/week-01.mp4",
//!   "destination_path": "/var/lib/tidefetch/downloads/course-42",
//!   "file_name": "week-01.mp4",
//!   "identifier": "course-42",
//!   "priority": "high",
//!   "network_requirement": "unmetered",
//!   "scheduled_time": "2026-05-01T02:00:00Z",
//!   "metadata": { "title": "Week 1" },
//!   "selected_files": ["week-01.mp4"]
//! }
//! ```
//!
//! Only `url`, `destination_path` and `file_name` are required. Task
//! snapshots are returned as [`TaskView`], which adds the derived phase and
//! progress to the stored record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::humanize::format_progress;
use crate::observability::MetricsSnapshot;
use crate::task::{
    LinkType, NetworkRequirement, NewTask, PauseReason, Priority, TaskPhase, TaskRecord,
    TaskStatus,
};

#[derive(Debug, Deserialize, Clone)]
pub struct CreateTaskRequest {
    pub url: String,
    pub destination_path: PathBuf,
    pub file_name: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub network_requirement: NetworkRequirement,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub selected_files: Option<Value>,
}

impl From<CreateTaskRequest> for NewTask {
    fn from(request: CreateTaskRequest) -> Self {
        NewTask::builder()
            .source_url(request.url)
            .destination_path(request.destination_path)
            .file_name(request.file_name)
            .content_id(request.identifier)
            .priority(request.priority)
            .network_requirement(request.network_requirement)
            .maybe_scheduled_time(request.scheduled_time)
            .maybe_total_bytes(request.total_bytes)
            .maybe_metadata(request.metadata)
            .maybe_selected_files(request.selected_files)
            .build()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TaskAcceptedResponse {
    pub task_id: String,
}

/// Snapshot of one task as returned by the API
#[derive(Debug, Serialize, Clone)]
pub struct TaskView {
    pub id: String,
    pub identifier: String,
    pub url: String,
    pub destination_path: PathBuf,
    pub file_name: String,
    pub status: TaskStatus,
    pub pause_reason: Option<PauseReason>,
    pub phase: TaskPhase,
    pub priority: Priority,
    pub network_requirement: NetworkRequirement,
    pub total_bytes: Option<u64>,
    pub partial_bytes: u64,
    pub progress: f64,
    pub progress_display: String,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    pub selected_files: Option<Value>,
}

impl From<TaskRecord> for TaskView {
    fn from(task: TaskRecord) -> Self {
        Self {
            phase: task.phase(),
            progress: task.progress(),
            progress_display: format_progress(task.partial_bytes, task.total_bytes),
            id: task.id,
            identifier: task.content_id,
            url: task.source_url,
            destination_path: task.destination_path,
            file_name: task.file_name,
            status: task.status,
            pause_reason: task.pause_reason,
            priority: task.priority,
            network_requirement: task.network_requirement,
            total_bytes: task.total_bytes,
            partial_bytes: task.partial_bytes,
            retry_count: task.retry_count,
            error_message: task.error_message,
            scheduled_time: task.scheduled_time,
            created_at: task.created_at,
            updated_at: task.updated_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            metadata: task.metadata,
            selected_files: task.selected_files,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub count: usize,
    pub tasks: Vec<TaskView>,
}

impl TaskListResponse {
    pub fn new(tasks: Vec<TaskRecord>) -> Self {
        let tasks: Vec<TaskView> = tasks.into_iter().map(TaskView::from).collect();
        Self {
            count: tasks.len(),
            tasks,
        }
    }
}

/// Query string of `GET /tasks`
#[derive(Debug, Deserialize, Default)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkUpdate {
    pub link: LinkType,
}

#[derive(Debug, Serialize)]
pub struct NetworkResponse {
    pub link: LinkType,
    pub changed: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct PurgeRequest {
    /// Defaults to the configured retention TTL
    pub older_than_days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: usize,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub counters: MetricsSnapshot,
    pub tasks: HashMap<TaskStatus, usize>,
    pub active_workers: usize,
    pub worker_capacity: usize,
    pub link: LinkType,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}
