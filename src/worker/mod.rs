//! Download workers
//!
//! A [`WorkerPool`] runs up to N [`TaskRunner`]s in parallel. Each runner
//! owns one claimed task: it streams the remote body into the destination
//! file at the persisted offset, checkpoints progress on a bounded cadence,
//! and writes the task's final state before releasing its slot. Pause and
//! cancel are cooperative signals observed between chunks.

pub mod error;
pub mod http;
pub mod pool;
pub mod runner;

pub use error::TransferError;
pub use http::{FetchRequest, HttpConfig, HttpSource, ReqwestSource, ResponseKind, SourceResponse};
pub use pool::{WorkerPool, WorkerReport};
pub use runner::{RunOutcome, RunnerConfig, TaskRunner, TaskSignal};

pub use crate::task::PauseReason;
