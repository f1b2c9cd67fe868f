//! Shared aggregate for one batch.
//!
//! [`BatchState`] is the only shared mutable resource in a batch run. All
//! writers go through [`BatchState::record`], which applies the outcome and
//! every counter update under one mutex, so a concurrent
//! [`BatchState::snapshot`] never observes a partially applied record.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::outcome::{Outcome, TaskRecord};
use super::{BatchId, TaskId};
use crate::error::InvariantViolation;

/// Version of the persisted snapshot layout.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    Cancelled,
}

impl BatchStatus {
    /// True once the batch can no longer change.
    pub fn is_finished(&self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Running => write!(f, "running"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Counters observed right after a successful record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordProgress {
    pub completed: usize,
    pub total: usize,
}

impl RecordProgress {
    pub fn is_last(&self) -> bool {
        self.completed == self.total
    }
}

/// Immutable, consistent copy of a batch. Also the persistence format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub schema_version: u32,
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
}

impl BatchSnapshot {
    /// Wall-clock duration, if the batch has ended.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }

    /// Number of tasks whose outcome is an infrastructure failure.
    pub fn infrastructure_failures(&self) -> usize {
        self.tasks
            .values()
            .filter(|r| r.outcome.is_infrastructure_failure())
            .count()
    }

    /// Counts grouped by outcome label.
    pub fn outcome_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for record in self.tasks.values() {
            *counts.entry(record.outcome.label()).or_insert(0) += 1;
        }
        counts
    }
}

struct Inner {
    status: BatchStatus,
    completed: usize,
    passed: usize,
    failed: usize,
    tasks: BTreeMap<TaskId, TaskRecord>,
    ended_at: Option<DateTime<Utc>>,
}

/// Mutable aggregate shared between one batch run and its observers.
pub struct BatchState {
    batch_id: BatchId,
    total: usize,
    expected: HashSet<TaskId>,
    started_at: DateTime<Utc>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<BatchStatus>,
}

impl BatchState {
    /// Creates a Running state for the given tasks.
    ///
    /// Callers are expected to have rejected duplicate ids already; the
    /// total is the number of distinct ids.
    pub fn new(batch_id: BatchId, task_ids: &[TaskId]) -> Self {
        let expected: HashSet<TaskId> = task_ids.iter().cloned().collect();
        let (status_tx, _) = watch::channel(BatchStatus::Running);
        Self {
            batch_id,
            total: expected.len(),
            expected,
            started_at: Utc::now(),
            inner: Mutex::new(Inner {
                status: BatchStatus::Running,
                completed: 0,
                passed: 0,
                failed: 0,
                tasks: BTreeMap::new(),
                ended_at: None,
            }),
            status_tx,
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> BatchStatus {
        self.lock().status
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lock().ended_at
    }

    /// Number of tasks with an outcome.
    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    /// Whether any task was recorded as [`Outcome::Cancelled`].
    pub fn any_cancelled(&self) -> bool {
        self.lock()
            .tasks
            .values()
            .any(|record| record.outcome == Outcome::Cancelled)
    }

    /// Whether the task is part of this batch and still has no outcome.
    pub fn is_pending(&self, task_id: &TaskId) -> bool {
        self.expected.contains(task_id) && !self.lock().tasks.contains_key(task_id)
    }

    /// Records the outcome of one task.
    ///
    /// Check and insert happen under one lock: an unknown task, a second
    /// record for the same task, or a record after the state was sealed
    /// is rejected and leaves the state untouched.
    pub fn record(
        &self,
        task_id: &TaskId,
        outcome: Outcome,
        duration: Duration,
    ) -> Result<RecordProgress, InvariantViolation> {
        if !self.expected.contains(task_id) {
            return Err(InvariantViolation::UnknownTask {
                batch_id: self.batch_id.clone(),
                task_id: task_id.clone(),
            });
        }

        let mut inner = self.lock();
        if inner.status.is_finished() {
            return Err(InvariantViolation::Sealed {
                batch_id: self.batch_id.clone(),
                task_id: task_id.clone(),
            });
        }
        if inner.tasks.contains_key(task_id) {
            return Err(InvariantViolation::DuplicateRecord {
                batch_id: self.batch_id.clone(),
                task_id: task_id.clone(),
            });
        }

        if outcome.is_passed() {
            inner.passed += 1;
        } else {
            inner.failed += 1;
        }
        inner.completed += 1;
        inner
            .tasks
            .insert(task_id.clone(), TaskRecord::new(outcome, duration));

        Ok(RecordProgress {
            completed: inner.completed,
            total: self.total,
        })
    }

    /// Marks the batch Completed. Requires every task to be recorded.
    ///
    /// Finalizing an already Completed state is a no-op.
    pub fn finalize(&self) -> Result<(), InvariantViolation> {
        let mut inner = self.lock();
        match inner.status {
            BatchStatus::Completed => return Ok(()),
            BatchStatus::Cancelled => {
                return Err(InvariantViolation::Incomplete {
                    batch_id: self.batch_id.clone(),
                    completed: inner.completed,
                    total: self.total,
                })
            }
            BatchStatus::Running => {}
        }
        if inner.completed != self.total {
            return Err(InvariantViolation::Incomplete {
                batch_id: self.batch_id.clone(),
                completed: inner.completed,
                total: self.total,
            });
        }
        inner.status = BatchStatus::Completed;
        inner.ended_at = Some(Utc::now());
        drop(inner);

        self.status_tx.send_replace(BatchStatus::Completed);
        Ok(())
    }

    /// Seals the batch as Cancelled, recording `Cancelled` for every task
    /// that has no outcome yet. Returns how many tasks were filled in.
    pub fn seal_cancelled(&self) -> usize {
        let mut inner = self.lock();
        if inner.status.is_finished() {
            return 0;
        }

        let missing: Vec<TaskId> = self
            .expected
            .iter()
            .filter(|id| !inner.tasks.contains_key(*id))
            .cloned()
            .collect();
        for task_id in &missing {
            inner.failed += 1;
            inner.completed += 1;
            inner
                .tasks
                .insert(task_id.clone(), TaskRecord::new(Outcome::Cancelled, Duration::ZERO));
        }
        inner.status = BatchStatus::Cancelled;
        inner.ended_at = Some(Utc::now());
        drop(inner);

        self.status_tx.send_replace(BatchStatus::Cancelled);
        missing.len()
    }

    /// Consistent copy of every field.
    pub fn snapshot(&self) -> BatchSnapshot {
        let inner = self.lock();
        BatchSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            batch_id: self.batch_id.clone(),
            status: inner.status,
            total: self.total,
            completed: inner.completed,
            passed: inner.passed,
            failed: inner.failed,
            pass_rate: pass_rate(inner.passed, self.total),
            started_at: self.started_at,
            ended_at: inner.ended_at,
            tasks: inner.tasks.clone(),
        }
    }

    /// `passed / total`, or 0 for an empty batch. Partial while Running.
    pub fn pass_rate(&self) -> f64 {
        pass_rate(self.lock().passed, self.total)
    }

    /// Waits until the batch leaves Running and returns the final status.
    pub async fn wait_finished(&self) -> BatchStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|status| status.is_finished()).await {
            Ok(status) => *status,
            // The sender lives as long as self, so this only happens on a
            // state that was already finished.
            Err(_) => self.status(),
        };
        status
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave Inner half-updated:
        // every mutation is a handful of infallible assignments.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("BatchState")
            .field("batch_id", &self.batch_id)
            .field("status", &inner.status)
            .field("total", &self.total)
            .field("completed", &inner.completed)
            .field("passed", &inner.passed)
            .field("failed", &inner.failed)
            .finish()
    }
}

fn pass_rate(passed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    passed as f64 / total as f64
}
