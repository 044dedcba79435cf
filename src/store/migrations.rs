/// Ordered, idempotent schema migrations
///
/// The stored schema version lives under `meta:schema_version` as a
/// big-endian `u32`. A keyspace holding task rows but no version is a
/// version 1 store. Each step rewrites rows in a single batch together with
/// the new version number, so an interrupted upgrade resumes from the last
/// completed step.
use serde_json::{json, Map, Value};
use tracing::info;

use crate::task::{TaskRecord, TaskStatus};

use super::error::{Result, StoreError};
use super::partitions::{encode_meta_key, IndexEntries, META_SCHEMA_VERSION};
use super::store::TaskStore;

pub const CURRENT_SCHEMA_VERSION: u32 = 7;

type RowMigration = fn(&mut Map<String, Value>) -> std::result::Result<(), String>;

enum Step {
    Rows(RowMigration),
    RebuildIndexes,
}

struct Migration {
    version: u32,
    description: &'static str,
    step: Step,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        description: "text status and resumption columns",
        step: Step::Rows(status_as_text),
    },
    Migration {
        version: 3,
        description: "priority, network requirement and deferred start",
        step: Step::Rows(scheduling_columns),
    },
    Migration {
        version: 4,
        description: "retry and lifecycle timestamps",
        step: Step::Rows(retry_columns),
    },
    Migration {
        version: 5,
        description: "metadata and file selection",
        step: Step::Rows(content_columns),
    },
    Migration {
        version: 6,
        description: "secondary indexes",
        step: Step::RebuildIndexes,
    },
    Migration {
        version: 7,
        description: "pause reason",
        step: Step::Rows(pause_reason_column),
    },
];

fn add_default(row: &mut Map<String, Value>, column: &str, value: Value) {
    row.entry(column).or_insert(value);
}

fn status_as_text(row: &mut Map<String, Value>) -> std::result::Result<(), String> {
    if let Some(code) = row.get("status").and_then(Value::as_i64) {
        let status =
            TaskStatus::from_legacy_code(code).ok_or_else(|| format!("unknown status code {code}"))?;
        row.insert("status".to_string(), Value::from(status.as_str()));
    }
    add_default(row, "partial_bytes", json!(0));
    add_default(row, "etag", Value::Null);
    add_default(row, "last_modified", Value::Null);
    Ok(())
}

fn scheduling_columns(row: &mut Map<String, Value>) -> std::result::Result<(), String> {
    add_default(row, "priority", json!("normal"));
    add_default(row, "network_requirement", json!("any"));
    add_default(row, "scheduled_time", Value::Null);
    Ok(())
}

fn retry_columns(row: &mut Map<String, Value>) -> std::result::Result<(), String> {
    add_default(row, "retry_count", json!(0));
    add_default(row, "error_message", Value::Null);
    add_default(row, "started_at", Value::Null);
    add_default(row, "completed_at", Value::Null);
    Ok(())
}

fn content_columns(row: &mut Map<String, Value>) -> std::result::Result<(), String> {
    add_default(row, "metadata", Value::Null);
    add_default(row, "selected_files", Value::Null);
    Ok(())
}

/// Rows paused before the reason was recorded were user pauses: system
/// pauses used to go straight back to the queue.
fn pause_reason_column(row: &mut Map<String, Value>) -> std::result::Result<(), String> {
    let paused = row.get("status").and_then(Value::as_str) == Some(TaskStatus::Paused.as_str());
    let reason = if paused { json!("user") } else { Value::Null };
    add_default(row, "pause_reason", reason);
    Ok(())
}

impl TaskStore {
    /// Schema version recorded in the keyspace
    pub fn schema_version(&self) -> Result<u32> {
        Ok(self.stored_schema_version()?.unwrap_or(1))
    }

    fn stored_schema_version(&self) -> Result<Option<u32>> {
        let Some(value) = self.metadata.get(encode_meta_key(META_SCHEMA_VERSION))? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = value.as_ref().try_into().map_err(|_| StoreError::Migration {
            version: 0,
            reason: "malformed schema version".to_string(),
        })?;
        Ok(Some(u32::from_be_bytes(bytes)))
    }

    /// Bring the keyspace up to [`CURRENT_SCHEMA_VERSION`]
    pub(super) fn migrate(&self) -> Result<()> {
        let _guard = self.lock();

        let version = match self.stored_schema_version()? {
            Some(version) => version,
            None if self.tasks.is_empty()? => {
                self.metadata.insert(
                    encode_meta_key(META_SCHEMA_VERSION),
                    CURRENT_SCHEMA_VERSION.to_be_bytes().to_vec(),
                )?;
                self.persist()?;
                return Ok(());
            }
            None => 1,
        };

        if version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::Migration {
                version,
                reason: format!("store is newer than supported v{CURRENT_SCHEMA_VERSION}"),
            });
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > version) {
            info!(
                version = migration.version,
                "Applying migration: {}", migration.description
            );
            match migration.step {
                Step::Rows(apply) => self.rewrite_rows(migration.version, apply)?,
                Step::RebuildIndexes => self.rebuild_indexes(migration.version)?,
            }
        }

        Ok(())
    }

    fn rewrite_rows(&self, version: u32, apply: RowMigration) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for item in self.tasks.iter() {
            let (key, value) = item?;
            let mut row: Value = serde_json::from_slice(&value)?;
            let Some(columns) = row.as_object_mut() else {
                return Err(StoreError::Migration {
                    version,
                    reason: format!("row {} is not an object", String::from_utf8_lossy(&key)),
                });
            };
            apply(columns).map_err(|reason| StoreError::Migration { version, reason })?;
            batch.insert(&self.tasks, key, serde_json::to_vec(&row)?);
        }

        batch.insert(
            &self.metadata,
            encode_meta_key(META_SCHEMA_VERSION),
            version.to_be_bytes().to_vec(),
        );
        batch.commit()?;
        self.persist()
    }

    fn rebuild_indexes(&self, version: u32) -> Result<()> {
        let mut clear = self.keyspace.batch();
        for partition in [
            &self.by_status,
            &self.by_order,
            &self.by_schedule,
            &self.by_identifier,
        ] {
            for item in partition.iter() {
                let (key, _) = item?;
                clear.remove(partition, key);
            }
        }
        clear.commit()?;

        let mut batch = self.keyspace.batch();
        for item in self.tasks.iter() {
            let (_, value) = item?;
            let task: TaskRecord = serde_json::from_slice(&value)?;
            let entries = IndexEntries::for_task(&task);
            batch.insert(&self.by_status, entries.status, Vec::<u8>::new());
            batch.insert(&self.by_order, entries.order, Vec::<u8>::new());
            batch.insert(&self.by_identifier, entries.identifier, Vec::<u8>::new());
            if let Some(schedule) = entries.schedule {
                batch.insert(&self.by_schedule, schedule, Vec::<u8>::new());
            }
        }
        batch.insert(
            &self.metadata,
            encode_meta_key(META_SCHEMA_VERSION),
            version.to_be_bytes().to_vec(),
        );
        batch.commit()?;
        self.persist()
    }
}
