//! Table of submitted batches for long-running services.
//!
//! This module provides functionality for:
//! - Submitting batches that run in the background
//! - Looking up live status by batch id
//! - Cancelling and removing batches
//! - Evicting finished batches once their retention has passed
//!
//! Running batches are never evicted; they leave the table only through an
//! explicit [`BatchRegistry::remove`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::batch::{BatchId, BatchSnapshot, BatchState, BatchStatus, TaskId};
use crate::error::{BatchError, RegistryError};
use crate::scheduler::{BatchOptions, Scheduler};

/// Counters for one batch, without per-task detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&BatchSnapshot> for BatchSummary {
    fn from(snap: &BatchSnapshot) -> Self {
        Self {
            batch_id: snap.batch_id.clone(),
            status: snap.status,
            total: snap.total,
            completed: snap.completed,
            passed: snap.passed,
            failed: snap.failed,
            pass_rate: snap.pass_rate,
            started_at: snap.started_at,
            ended_at: snap.ended_at,
        }
    }
}

struct Entry {
    state: Arc<BatchState>,
    cancel: CancellationToken,
}

/// Tracks batches submitted to one scheduler.
pub struct BatchRegistry {
    scheduler: Scheduler,
    retention: Duration,
    batches: RwLock<HashMap<BatchId, Entry>>,
}

impl BatchRegistry {
    /// Finished batches are kept for `retention` after they end.
    pub fn new(scheduler: Scheduler, retention: Duration) -> Self {
        Self {
            scheduler,
            retention,
            batches: RwLock::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Starts a batch and returns its id without waiting for it.
    pub fn submit(
        &self,
        task_ids: Vec<TaskId>,
        options: BatchOptions,
    ) -> Result<BatchId, BatchError> {
        let handle = self.scheduler.spawn_batch(task_ids, options)?;
        let batch_id = handle.batch_id().clone();

        self.write().insert(
            batch_id.clone(),
            Entry {
                state: Arc::clone(handle.state()),
                cancel: handle.cancel_token(),
            },
        );

        let id = batch_id.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.join().await {
                error!(batch_id = %id, error = %e, "Batch ended with an error");
            }
        });

        info!(batch_id = %batch_id, "Submitted batch");
        Ok(batch_id)
    }

    /// Consistent snapshot of a batch.
    pub fn status(&self, batch_id: &BatchId) -> Result<BatchSnapshot, RegistryError> {
        Ok(self.state(batch_id)?.snapshot())
    }

    /// Shared live state of a batch.
    pub fn state(&self, batch_id: &BatchId) -> Result<Arc<BatchState>, RegistryError> {
        self.read()
            .get(batch_id)
            .map(|entry| Arc::clone(&entry.state))
            .ok_or_else(|| RegistryError::NotFound(batch_id.clone()))
    }

    /// Requests cancellation. A no-op for a finished batch. Returns the
    /// status observed at the time of the call.
    pub fn cancel(&self, batch_id: &BatchId) -> Result<BatchStatus, RegistryError> {
        let batches = self.read();
        let entry = batches
            .get(batch_id)
            .ok_or_else(|| RegistryError::NotFound(batch_id.clone()))?;
        let status = entry.state.status();
        if !status.is_finished() {
            info!(batch_id = %batch_id, "Cancelling batch");
            entry.cancel.cancel();
        }
        Ok(status)
    }

    /// Drops a batch from the table, cancelling it first if it is still
    /// running. Returns its last snapshot.
    pub fn remove(&self, batch_id: &BatchId) -> Result<BatchSnapshot, RegistryError> {
        let entry = self
            .write()
            .remove(batch_id)
            .ok_or_else(|| RegistryError::NotFound(batch_id.clone()))?;
        entry.cancel.cancel();
        debug!(batch_id = %batch_id, "Removed batch");
        Ok(entry.state.snapshot())
    }

    /// Summaries of every tracked batch, oldest first.
    pub fn list(&self) -> Vec<BatchSummary> {
        let mut summaries: Vec<BatchSummary> = self
            .read()
            .values()
            .map(|entry| BatchSummary::from(&entry.state.snapshot()))
            .collect();
        summaries.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.batch_id.cmp(&b.batch_id))
        });
        summaries
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of batches still running.
    pub fn running(&self) -> usize {
        self.read()
            .values()
            .filter(|entry| !entry.state.status().is_finished())
            .count()
    }

    /// Drops finished batches whose retention has passed at `now`. Returns
    /// how many were evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = self.retention;
        let mut batches = self.write();
        let before = batches.len();
        batches.retain(|batch_id, entry| {
            let expired = match entry.state.ended_at() {
                Some(ended) => matches!((now - ended).to_std(), Ok(age) if age >= retention),
                None => false,
            };
            if expired {
                debug!(batch_id = %batch_id, "Evicting expired batch");
            }
            !expired
        });
        before - batches.len()
    }

    /// Runs [`evict_expired`](Self::evict_expired) every `interval` until
    /// the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick
            loop {
                tick.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.evict_expired(Utc::now());
                if evicted > 0 {
                    info!(evicted, remaining = registry.len(), "Evicted expired batches");
                }
            }
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<BatchId, Entry>> {
        self.batches.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<BatchId, Entry>> {
        self.batches.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterPair, Script, ScriptedAdapter};

    fn registry(script: Script, retention: Duration) -> BatchRegistry {
        let adapter = ScriptedAdapter::new(script);
        BatchRegistry::new(Scheduler::from_pair(AdapterPair::from_adapter(adapter)), retention)
    }

    fn ids(raw: &[&str]) -> Vec<TaskId> {
        raw.iter().map(|s| TaskId::from(*s)).collect()
    }

    #[tokio::test]
    async fn test_submit_and_status() {
        let registry = registry(Script::pass(), Duration::from_secs(3600));
        let batch_id = registry
            .submit(ids(&["a", "b"]), BatchOptions::new(2))
            .unwrap();

        let state = registry.state(&batch_id).unwrap();
        assert_eq!(state.wait_finished().await, BatchStatus::Completed);

        let snap = registry.status(&batch_id).unwrap();
        assert_eq!(snap.passed, 2);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.running(), 0);
    }

    #[tokio::test]
    async fn test_unknown_batch_is_not_found() {
        let registry = registry(Script::pass(), Duration::from_secs(60));
        let missing = BatchId::from("batch_missing");
        assert!(matches!(
            registry.status(&missing),
            Err(RegistryError::NotFound(ref id)) if *id == missing
        ));
        assert!(registry.cancel(&missing).is_err());
        assert!(registry.remove(&missing).is_err());
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_options() {
        let registry = registry(Script::pass(), Duration::from_secs(60));
        let err = registry
            .submit(ids(&["a"]), BatchOptions::new(0))
            .unwrap_err();
        assert!(matches!(err, BatchError::Config(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_batch() {
        let registry = registry(Script::Hang, Duration::from_secs(60));
        let batch_id = registry
            .submit(
                ids(&["a", "b", "c"]),
                BatchOptions::new(1).with_cancel_grace(Duration::from_secs(1)),
            )
            .unwrap();

        assert_eq!(registry.cancel(&batch_id).unwrap(), BatchStatus::Running);
        let state = registry.state(&batch_id).unwrap();
        assert_eq!(state.wait_finished().await, BatchStatus::Cancelled);
        assert_eq!(state.completed(), 3);
    }

    #[tokio::test]
    async fn test_evict_only_expired_finished_batches() {
        let registry = registry(Script::pass(), Duration::from_secs(60));
        let done = registry.submit(ids(&["a"]), BatchOptions::new(1)).unwrap();
        registry.state(&done).unwrap().wait_finished().await;

        let hanging = BatchRegistry::new(
            Scheduler::from_pair(AdapterPair::from_adapter(ScriptedAdapter::new(Script::Hang))),
            Duration::ZERO,
        );
        let running = hanging.submit(ids(&["x"]), BatchOptions::new(1)).unwrap();

        // Within retention.
        assert_eq!(registry.evict_expired(Utc::now()), 0);
        // Past retention.
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(registry.evict_expired(later), 1);
        assert!(registry.status(&done).is_err());

        // Running batches survive any retention.
        assert_eq!(hanging.evict_expired(later), 0);
        assert!(hanging.status(&running).is_ok());
        hanging.remove(&running).unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_evicts_in_background() {
        let registry = Arc::new(registry(Script::pass(), Duration::ZERO));
        let batch_id = registry.submit(ids(&["a"]), BatchOptions::new(1)).unwrap();
        registry.state(&batch_id).unwrap().wait_finished().await;

        let sweeper = registry.spawn_sweeper(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweeper should evict the finished batch");
        sweeper.abort();
    }
}
