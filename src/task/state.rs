use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskStateError {
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("Cannot complete with {partial} of {total:?} bytes")]
    Incomplete { partial: u64, total: Option<u64> },

    #[error("Progress may not move backwards ({current} -> {requested})")]
    ProgressRegression { current: u64, requested: u64 },

    #[error("Progress {partial} exceeds total size {total}")]
    ProgressOverflow { partial: u64, total: u64 },

    #[error("Unknown status: {0}")]
    UnknownStatus(String),
}

/// Lifecycle status of a task.
///
/// Persisted as the lowercase name (`"queued"`, `"running"`, ...). Schema
/// version 1 stored the numeric [`TaskStatus::legacy_code`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Integer code used by the first on-disk schema
    pub fn legacy_code(self) -> i64 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Running => 1,
            TaskStatus::Paused => 2,
            TaskStatus::Completed => 3,
            TaskStatus::Failed => 4,
            TaskStatus::Cancelled => 5,
        }
    }

    pub fn from_legacy_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.legacy_code() == code)
    }

    /// `failed` is only terminal once the retry policy gave up, which is the
    /// only way a failed record is ever persisted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Queued)
                | (Paused, Cancelled)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TaskStateError::UnknownStatus(s.to_string()))
    }
}
