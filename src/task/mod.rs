//! Task records and their lifecycle
//!
//! A [`TaskRecord`] is the durable description of one file transfer. All
//! status changes go through the transition methods on the record, which
//! enforce the lifecycle:
//!
//! ```text
//! queued ──► running ──► completed
//!   │          │  ├────► failed ──► queued (retry)
//!   │          │  └────► cancelled
//!   │          ▼
//!   │        paused ──► queued
//!   └──────────────────► cancelled
//! ```

mod model;
mod state;

pub use model::{
    LinkType, NetworkRequirement, NewTask, PauseReason, Priority, TaskPhase, TaskRecord,
    Validators,
};
pub use state::{TaskStateError, TaskStatus};
