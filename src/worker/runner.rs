//! Task runner - executes one claimed task against the remote source

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{StoreError, TaskStore};
use crate::task::{PauseReason, TaskRecord, TaskStatus, Validators};

use super::error::{Result, TransferError};
use super::http::{BodyStream, FetchRequest, HttpSource, ResponseKind};

/// Control signal delivered to a running worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSignal {
    Run,
    Pause(PauseReason),
    Cancel,
}

/// Final state a worker left its task in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { bytes: u64 },
    Paused(PauseReason),
    Cancelled,
    /// Transfer failed and the retry policy queued another attempt
    Requeued { retry_count: u32, delay: Duration },
    /// Transfer failed terminally
    Failed { message: String },
    /// The final state could not be written. The record is still `running`.
    Aborted { reason: String },
}

/// Persistence cadence for in-flight progress
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Persist after this many new bytes
    pub persist_every: u64,
    /// ...or after this much time, whichever comes first
    pub persist_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            persist_every: 1024 * 1024,
            persist_interval: Duration::from_secs(2),
        }
    }
}

enum Stop {
    Finished,
    Interrupted(Interrupt),
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Pause(PauseReason),
    Cancel,
}

/// Resolves once the control channel carries a pause or cancel
async fn next_interrupt(signals: &mut watch::Receiver<TaskSignal>) -> Interrupt {
    loop {
        let current = *signals.borrow_and_update();
        match current {
            TaskSignal::Pause(reason) => return Interrupt::Pause(reason),
            TaskSignal::Cancel => return Interrupt::Cancel,
            TaskSignal::Run => {}
        }
        if signals.changed().await.is_err() {
            return Interrupt::Pause(PauseReason::Shutdown);
        }
    }
}

/// Executes the resumption protocol for one task and writes its final state
pub struct TaskRunner {
    store: Arc<TaskStore>,
    source: Arc<dyn HttpSource>,
    retry: RetryPolicy,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(
        store: Arc<TaskStore>,
        source: Arc<dyn HttpSource>,
        retry: RetryPolicy,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            source,
            retry,
            config,
        }
    }

    /// Run a task the caller has already claimed (`running` in the store)
    pub async fn run(&self, task: TaskRecord, mut signals: watch::Receiver<TaskSignal>) -> RunOutcome {
        let id = task.id.clone();
        info!(
            task_id = %id,
            url = %task.source_url,
            partial_bytes = task.partial_bytes,
            "Processing task"
        );

        let result = self.transfer(task, &mut signals).await;
        match self.finish(&id, result) {
            Ok(outcome) => {
                info!(task_id = %id, outcome = ?outcome, "Task finished");
                outcome
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Failed to record task outcome");
                RunOutcome::Aborted {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn transfer(
        &self,
        mut task: TaskRecord,
        signals: &mut watch::Receiver<TaskSignal>,
    ) -> Result<Stop> {
        let path = task.destination_file();
        tokio::fs::create_dir_all(&task.destination_path).await?;

        // Bytes past the persisted offset may exist on disk; bytes below it
        // must, or the partial file is unusable.
        let on_disk = file_len(&path).await?;
        let resumable = task.partial_bytes > 0
            && on_disk >= task.partial_bytes
            && task.validators().if_range().is_some();
        if task.partial_bytes > 0 && !resumable {
            warn!(
                task_id = %task.id,
                partial_bytes = task.partial_bytes,
                on_disk,
                "Partial download cannot be resumed; restarting from zero"
            );
            let total = task.total_bytes;
            task = self.reset(&task.id, Validators::default(), total)?;
        }

        let mut restarted = false;
        loop {
            let offset = task.partial_bytes;
            let request = FetchRequest {
                url: task.source_url.clone(),
                offset,
                if_range: (offset > 0)
                    .then(|| task.validators().if_range().map(String::from))
                    .flatten(),
            };

            let response = tokio::select! {
                biased;
                interrupt = next_interrupt(signals) => return Ok(Stop::Interrupted(interrupt)),
                response = self.source.fetch(request) => response?,
            };
            let stored = task.validators();
            let kind = response.kind;

            match kind {
                ResponseKind::Partial { start }
                    if offset > 0
                        && start == offset
                        && !stored.conflicts_with(&response.validators)
                        && !totals_conflict(task.total_bytes, response.total_bytes) =>
                {
                    debug!(task_id = %task.id, offset, "Resuming transfer");
                    if task.total_bytes.is_none() && response.total_bytes.is_some() {
                        let total = response.total_bytes;
                        task = self.store.update(&task.id, &[TaskStatus::Running], |t| {
                            t.total_bytes = total;
                            Ok(())
                        })?;
                    }
                    let file = open_at(&path, offset).await?;
                    return self.stream(task, file, response.body, signals).await;
                }
                ResponseKind::RangeNotSatisfiable
                    if offset > 0
                        && response.total_bytes == Some(offset)
                        && task.total_bytes.is_none_or(|total| total == offset)
                        && !stored.conflicts_with(&response.validators) =>
                {
                    debug!(task_id = %task.id, offset, "Nothing left to fetch");
                    open_at(&path, offset).await?.sync_all().await?;
                    if task.total_bytes.is_none() {
                        self.store.update(&task.id, &[TaskStatus::Running], |t| {
                            t.total_bytes = Some(offset);
                            Ok(())
                        })?;
                    }
                    return Ok(Stop::Finished);
                }
                ResponseKind::Full | ResponseKind::Partial { start: 0 } => {
                    if offset > 0 {
                        info!(
                            task_id = %task.id,
                            discarded_bytes = offset,
                            "Remote resource changed; restarting from zero"
                        );
                    }
                    // First contact or a failed If-Range: the body is the
                    // whole representation, so capture its validators now.
                    // A known total survives a response without a length
                    // unless the representation changed.
                    let total = match response.total_bytes {
                        Some(total) => Some(total),
                        None if !stored.conflicts_with(&response.validators) => task.total_bytes,
                        None => None,
                    };
                    task = self.reset(&task.id, response.validators, total)?;
                    let file = open_at(&path, 0).await?;
                    return self.stream(task, file, response.body, signals).await;
                }
                kind => {
                    if restarted {
                        return Err(TransferError::ValidationMismatch(format!(
                            "unusable {:?} response after restarting from zero",
                            kind
                        )));
                    }
                    info!(
                        task_id = %task.id,
                        response = ?kind,
                        discarded_bytes = offset,
                        "Resume rejected by remote; restarting from zero"
                    );
                    restarted = true;
                    let total = task.total_bytes;
                    task = self.reset(&task.id, Validators::default(), total)?;
                    open_at(&path, 0).await?;
                }
            }
        }
    }

    async fn stream(
        &self,
        mut task: TaskRecord,
        file: File,
        mut body: BodyStream,
        signals: &mut watch::Receiver<TaskSignal>,
    ) -> Result<Stop> {
        let mut writer = BufWriter::new(file);
        let mut written = task.partial_bytes;
        let mut persisted = written;

        let mut ticker = tokio::time::interval(self.config.persist_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                interrupt = next_interrupt(signals) => {
                    self.checkpoint(&task, &mut writer, written).await?;
                    debug!(task_id = %task.id, partial_bytes = written, "Transfer interrupted");
                    return Ok(Stop::Interrupted(interrupt));
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let next = written + bytes.len() as u64;
                        if let Some(total) = task.total_bytes {
                            if next > total {
                                self.checkpoint(&task, &mut writer, written).await?;
                                return Err(TransferError::Permanent(format!(
                                    "remote sent {} bytes past the advertised size {}",
                                    next - total,
                                    total
                                )));
                            }
                        }
                        writer.write_all(&bytes).await?;
                        written = next;
                        if written - persisted >= self.config.persist_every {
                            task = self.checkpoint(&task, &mut writer, written).await?;
                            persisted = written;
                        }
                    }
                    Some(Err(e)) => {
                        self.checkpoint(&task, &mut writer, written).await?;
                        return Err(e);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if written > persisted {
                        task = self.checkpoint(&task, &mut writer, written).await?;
                        persisted = written;
                    }
                }
            }
        }

        task = self.checkpoint(&task, &mut writer, written).await?;
        match task.total_bytes {
            Some(total) if written < total => Err(TransferError::Transient(format!(
                "stream ended at {} of {} bytes",
                written, total
            ))),
            _ => Ok(Stop::Finished),
        }
    }

    /// Flush written bytes to disk, then persist the offset
    async fn checkpoint(
        &self,
        task: &TaskRecord,
        writer: &mut BufWriter<File>,
        written: u64,
    ) -> Result<TaskRecord> {
        writer.flush().await?;
        writer.get_ref().sync_data().await?;
        if written == task.partial_bytes {
            return Ok(task.clone());
        }
        let task = self.store.record_progress(&task.id, written, Utc::now())?;
        debug!(task_id = %task.id, partial_bytes = written, "Progress persisted");
        Ok(task)
    }

    fn reset(&self, id: &str, validators: Validators, total: Option<u64>) -> Result<TaskRecord> {
        let task = self.store.update(id, &[TaskStatus::Running], |t| {
            t.reset_progress(validators, total, Utc::now());
            Ok(())
        })?;
        Ok(task)
    }

    /// Write the task's final state for this run
    fn finish(&self, id: &str, result: Result<Stop>) -> std::result::Result<RunOutcome, StoreError> {
        let now = Utc::now();
        match result {
            Ok(Stop::Finished) => {
                let task = self.store.update(id, &[TaskStatus::Running], |t| {
                    if t.total_bytes.is_none() {
                        t.total_bytes = Some(t.partial_bytes);
                    }
                    t.complete(now)?;
                    Ok(())
                })?;
                Ok(RunOutcome::Completed {
                    bytes: task.partial_bytes,
                })
            }
            Ok(Stop::Interrupted(Interrupt::Pause(reason))) => {
                self.store.update(id, &[TaskStatus::Running], |t| {
                    t.pause(reason, now)?;
                    if reason.requeues() {
                        t.requeue(now)?;
                    }
                    Ok(())
                })?;
                Ok(RunOutcome::Paused(reason))
            }
            Ok(Stop::Interrupted(Interrupt::Cancel)) => {
                self.store.update(id, &[TaskStatus::Running], |t| {
                    t.cancel(now)?;
                    Ok(())
                })?;
                Ok(RunOutcome::Cancelled)
            }
            Err(error) => {
                let class = error.class();
                let message = error.to_string();
                warn!(task_id = %id, error = %message, class = ?class, "Transfer failed");

                let mut decision = RetryDecision::Fail;
                let task = self.store.update(id, &[TaskStatus::Running], |t| {
                    decision = self.retry.decide(t.retry_count, class);
                    t.fail(message.clone(), now)?;
                    if let RetryDecision::Requeue { delay } = decision {
                        t.retry_at(not_before(now, delay), now)?;
                    }
                    Ok(())
                })?;

                Ok(match decision {
                    RetryDecision::Requeue { delay } => RunOutcome::Requeued {
                        retry_count: task.retry_count,
                        delay,
                    },
                    RetryDecision::Fail => RunOutcome::Failed { message },
                })
            }
        }
    }
}

fn not_before(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}

fn totals_conflict(stored: Option<u64>, reported: Option<u64>) -> bool {
    matches!((stored, reported), (Some(a), Some(b)) if a != b)
}

async fn file_len(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Open the destination for writing at `offset`, dropping anything past it
async fn open_at(path: &Path, offset: u64) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}
