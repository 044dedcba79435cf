/// Fjall-backed persistence for task records
///
/// The store is the single durable source of truth for every task. Each
/// record lives in the `tasks` partition, and four secondary index
/// partitions keep the queries the scheduler runs on every tick cheap:
///
/// - `by_status`: records of one status in dispatch order
/// - `by_order`: all records in dispatch order
/// - `by_schedule`: deferred queued records by start time
/// - `by_identifier`: records grouped by content item
///
/// A record and its index entries are always written in one batch, and the
/// journal is synced before any mutating call returns.
///
/// ## Usage
///
/// ```rust,ignore
/// use tidefetch::store::{ListQuery, TaskStore};
///
/// let store = TaskStore::open("data/tasks")?;
/// store.put(&task)?;
/// let claimed = store.claim(&task.id, Utc::now())?;
/// let queued = store.list(&ListQuery::status(TaskStatus::Queued))?;
/// ```

pub mod error;
pub mod migrations;
pub mod partitions;
pub mod pruning;
#[allow(clippy::module_inception)]
pub mod store;

pub use error::{Result, StoreError};
pub use migrations::CURRENT_SCHEMA_VERSION;
pub use pruning::RETENTION_COMPLETED_DAYS;
pub use store::{ListQuery, StoreStats, TaskStore};
