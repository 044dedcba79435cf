use thiserror::Error;

use crate::task::{TaskStateError, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {id} is {actual}, expected one of {expected:?}")]
    Conflict {
        id: String,
        expected: Vec<TaskStatus>,
        actual: TaskStatus,
    },

    #[error(transparent)]
    Transition(#[from] TaskStateError),

    #[error("Migration to schema v{version} failed: {reason}")]
    Migration { version: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
