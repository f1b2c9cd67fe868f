//! Bounded-concurrency batch execution.
//!
//! The [`Scheduler`] owns no state between batches. Each run creates a
//! fresh [`BatchState`], a semaphore sized to the batch concurrency and one
//! tokio task per task id. A slot is acquired before a worker is spawned,
//! so the number of live pipelines never exceeds the concurrency.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use super::options::BatchOptions;
use super::worker::{Worker, WorkerReport};
use crate::adapter::{AdapterPair, Launcher, Prober};
use crate::batch::{BatchId, BatchState, BatchStatus, TaskId};
use crate::error::{BatchError, InvariantViolation};
use crate::metrics::MetricsCollector;
use crate::store::ResultStore;

type JoinedWorker = Result<Result<WorkerReport, InvariantViolation>, JoinError>;

/// Runs batches of tasks against one launcher/prober pair.
#[derive(Clone)]
pub struct Scheduler {
    launcher: Arc<dyn Launcher>,
    prober: Arc<dyn Prober>,
    store: Option<Arc<dyn ResultStore>>,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(launcher: Arc<dyn Launcher>, prober: Arc<dyn Prober>) -> Self {
        Self {
            launcher,
            prober,
            store: None,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn from_pair(pair: AdapterPair) -> Self {
        Self::new(pair.launcher, pair.prober)
    }

    /// Saves every finished batch to `store`.
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Name of the execution backend.
    pub fn backend(&self) -> &'static str {
        self.launcher.name()
    }

    /// Runs every task to an outcome and returns the finalized state.
    ///
    /// Options are validated before anything is launched. Per-task failures
    /// are recorded as outcomes; only configuration errors and invariant
    /// violations come back as `Err`.
    pub async fn run_batch(
        &self,
        task_ids: Vec<TaskId>,
        options: BatchOptions,
    ) -> Result<Arc<BatchState>, BatchError> {
        let state = self.prepare(&task_ids, &options)?;
        self.clone()
            .drive(state, task_ids, options, CancellationToken::new())
            .await
    }

    /// Starts a batch in the background and returns at once.
    ///
    /// The returned handle exposes the Running state immediately.
    pub fn spawn_batch(
        &self,
        task_ids: Vec<TaskId>,
        options: BatchOptions,
    ) -> Result<BatchHandle, BatchError> {
        let state = self.prepare(&task_ids, &options)?;
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.clone().drive(
            Arc::clone(&state),
            task_ids,
            options,
            cancel.clone(),
        ));
        Ok(BatchHandle {
            state,
            cancel,
            join,
        })
    }

    fn prepare(
        &self,
        task_ids: &[TaskId],
        options: &BatchOptions,
    ) -> Result<Arc<BatchState>, BatchError> {
        if let Err(e) = options.validate(task_ids) {
            warn!(error = %e, "Rejected batch");
            return Err(e.into());
        }
        Ok(Arc::new(BatchState::new(BatchId::generate(), task_ids)))
    }

    async fn drive(
        self,
        state: Arc<BatchState>,
        task_ids: Vec<TaskId>,
        options: BatchOptions,
        cancel: CancellationToken,
    ) -> Result<Arc<BatchState>, BatchError> {
        let span = tracing::info_span!("batch", batch_id = %state.batch_id());
        async move {
            info!(
                total = state.total(),
                concurrency = options.concurrency,
                timeout_secs = options.per_task_timeout.as_secs(),
                backend = self.launcher.name(),
                "Starting batch"
            );
            self.metrics.batch_started();

            let worker = Worker {
                batch: Arc::clone(&state),
                launcher: Arc::clone(&self.launcher),
                prober: Arc::clone(&self.prober),
                launch_config: Arc::new(options.launch.clone()),
                timeout: options.per_task_timeout,
                cancel: cancel.clone(),
                metrics: self.metrics.clone(),
            };
            let semaphore = Arc::new(Semaphore::new(options.concurrency));
            let mut workers: JoinSet<Result<WorkerReport, InvariantViolation>> = JoinSet::new();
            let mut cancel_requests: Vec<JoinHandle<()>> = Vec::new();
            let mut failure: Option<InvariantViolation> = None;

            'dispatch: for task_id in task_ids {
                let permit = loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'dispatch,
                        Some(joined) = workers.join_next(), if !workers.is_empty() => {
                            if let Err(v) = reap(joined, &mut cancel_requests) {
                                failure = Some(v);
                                break 'dispatch;
                            }
                        }
                        permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                            Ok(permit) => break permit,
                            Err(_) => break 'dispatch,
                        },
                    }
                };
                workers.spawn(worker.clone().run(task_id, permit));
            }

            if failure.is_none() {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        joined = workers.join_next() => match joined {
                            None => break,
                            Some(joined) => {
                                if let Err(v) = reap(joined, &mut cancel_requests) {
                                    failure = Some(v);
                                    break;
                                }
                            }
                        },
                    }
                }
            }

            if !workers.is_empty() {
                // In-flight workers observe the token and record Cancelled.
                cancel.cancel();
                let in_flight = workers.len();
                let drained = tokio::time::timeout(options.cancel_grace, async {
                    while let Some(joined) = workers.join_next().await {
                        if let Err(v) = reap(joined, &mut cancel_requests) {
                            failure.get_or_insert(v);
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    warn!(
                        in_flight,
                        remaining = workers.len(),
                        grace_secs = options.cancel_grace.as_secs_f64(),
                        "Aborting workers that outlived the cancellation grace period"
                    );
                    workers.abort_all();
                    while let Some(joined) = workers.join_next().await {
                        if let Err(v) = reap(joined, &mut cancel_requests) {
                            failure.get_or_insert(v);
                        }
                    }
                }
            }

            let sealed = if let Some(violation) = failure {
                Err(violation)
            } else if cancel.is_cancelled()
                && (state.completed() < state.total() || state.any_cancelled())
            {
                let filled = state.seal_cancelled();
                info!(unstarted_or_aborted = filled, "Batch cancelled");
                Ok(())
            } else {
                state.finalize()
            };

            if let Err(violation) = sealed {
                error!(error = %violation, "Batch aborted");
                state.seal_cancelled();
                self.metrics.batch_finished("aborted");
                drain_cancels(cancel_requests, options.cancel_grace).await;
                return Err(violation.into());
            }

            let snapshot = state.snapshot();
            self.metrics.batch_finished(&snapshot.status.to_string());
            info!(
                status = %snapshot.status,
                completed = snapshot.completed,
                passed = snapshot.passed,
                failed = snapshot.failed,
                pass_rate = format!("{:.3}", snapshot.pass_rate),
                duration_secs = snapshot.duration().map(|d| d.as_secs_f64()).unwrap_or_default(),
                "Batch finished"
            );

            if let Some(store) = &self.store {
                match store.save(&snapshot).await {
                    Ok(location) => info!(location = %location, "Saved batch result"),
                    Err(e) => error!(error = %e, "Failed to save batch result"),
                }
            }

            drain_cancels(cancel_requests, options.cancel_grace).await;
            Ok(state)
        }
        .instrument(span)
        .await
    }
}

/// Folds one finished worker into the running batch.
fn reap(
    joined: JoinedWorker,
    cancel_requests: &mut Vec<JoinHandle<()>>,
) -> Result<(), InvariantViolation> {
    match joined {
        Ok(Ok(report)) => {
            cancel_requests.extend(report.cancel_request);
            Ok(())
        }
        Ok(Err(violation)) => Err(violation),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            // The task id is lost with the panic; finalize reports the gap.
            error!(error = %e, "Worker panicked");
            Ok(())
        }
    }
}

/// Waits at most `grace` for outstanding cancellation requests, then
/// abandons the rest.
async fn drain_cancels(mut requests: Vec<JoinHandle<()>>, grace: Duration) {
    requests.retain(|handle| !handle.is_finished());
    if requests.is_empty() {
        return;
    }

    let outstanding = requests.len();
    let drained = tokio::time::timeout(grace, async {
        for handle in requests.iter_mut() {
            let _ = handle.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(outstanding, "Abandoning cancellation requests after grace period");
        for handle in &requests {
            handle.abort();
        }
    }
}

/// A batch running in the background.
pub struct BatchHandle {
    state: Arc<BatchState>,
    cancel: CancellationToken,
    join: JoinHandle<Result<Arc<BatchState>, BatchError>>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> &BatchId {
        self.state.batch_id()
    }

    /// Live state; readable while the batch runs.
    pub fn state(&self) -> &Arc<BatchState> {
        &self.state
    }

    pub fn status(&self) -> BatchStatus {
        self.state.status()
    }

    /// Requests batch-level cancellation. Returns immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this batch when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the batch to finish.
    pub async fn join(self) -> Result<Arc<BatchState>, BatchError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                self.state.seal_cancelled();
                Err(InvariantViolation::Aborted {
                    batch_id: self.state.batch_id().clone(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Script, ScriptedAdapter};
    use crate::batch::Outcome;
    use crate::error::ConfigError;
    use crate::store::MemoryResultStore;

    fn ids(raw: &[&str]) -> Vec<TaskId> {
        raw.iter().map(|s| TaskId::from(*s)).collect()
    }

    #[tokio::test]
    async fn test_run_batch_all_pass() {
        let adapter = ScriptedAdapter::new(Script::pass());
        let stats = adapter.stats();
        let scheduler = Scheduler::from_pair(AdapterPair::from_adapter(adapter));

        let state = scheduler
            .run_batch(ids(&["a", "b", "c"]), BatchOptions::new(2))
            .await
            .unwrap();
        let snap = state.snapshot();
        assert_eq!(snap.status, BatchStatus::Completed);
        assert_eq!(snap.passed, 3);
        assert_eq!(stats.launches(), 3);
        assert!(snap.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_options_launch_nothing() {
        let adapter = ScriptedAdapter::new(Script::pass());
        let stats = adapter.stats();
        let scheduler = Scheduler::from_pair(AdapterPair::from_adapter(adapter));

        let err = scheduler
            .run_batch(ids(&["a"]), BatchOptions::new(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::Config(ConfigError::InvalidConcurrency(0))
        ));
        assert!(scheduler
            .spawn_batch(ids(&["a", "a"]), BatchOptions::new(1))
            .is_err());
        assert_eq!(stats.launches(), 0);
    }

    #[tokio::test]
    async fn test_store_receives_final_snapshot() {
        let store = Arc::new(MemoryResultStore::new());
        let scheduler =
            Scheduler::from_pair(AdapterPair::from_adapter(ScriptedAdapter::new(Script::pass())))
                .with_store(store.clone());

        let state = scheduler
            .run_batch(ids(&["a", "b"]), BatchOptions::new(2))
            .await
            .unwrap();
        let saved = store.load(state.batch_id()).await.unwrap();
        assert_eq!(saved, state.snapshot());
    }

    #[tokio::test]
    async fn test_cancelled_batch_seals_unfinished_tasks() {
        let adapter = ScriptedAdapter::new(Script::Hang);
        let stats = adapter.stats();
        let scheduler = Scheduler::from_pair(AdapterPair::from_adapter(adapter));

        let handle = scheduler
            .spawn_batch(
                ids(&["a", "b", "c", "d"]),
                BatchOptions::new(2).with_cancel_grace(Duration::from_secs(1)),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let state = handle.join().await.unwrap();
        let snap = state.snapshot();
        assert_eq!(snap.status, BatchStatus::Cancelled);
        assert_eq!(snap.completed, 4);
        assert!(snap.tasks.values().all(|r| r.outcome == Outcome::Cancelled));
        assert_eq!(stats.launches(), 2);
        assert_eq!(stats.cancels(), 2);
    }

    #[tokio::test]
    async fn test_rejected_record_aborts_batch_as_cancelled() {
        let adapter = ScriptedAdapter::new(Script::pass());
        let scheduler = Scheduler::from_pair(AdapterPair::from_adapter(adapter));
        let task_ids = ids(&["a", "b"]);
        let options = BatchOptions::new(1);

        let state = scheduler.prepare(&task_ids, &options).unwrap();
        // Something other than the worker already recorded "a".
        state
            .record(&TaskId::from("a"), Outcome::Passed, Duration::ZERO)
            .unwrap();

        let err = scheduler
            .clone()
            .drive(
                Arc::clone(&state),
                task_ids,
                options,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::Invariant(InvariantViolation::DuplicateRecord { ref task_id, .. })
                if task_id.as_str() == "a"
        ));
        assert_eq!(state.status(), BatchStatus::Cancelled);
        assert_eq!(state.completed(), state.total());
        assert!(state.ended_at().is_some());
    }

    async fn exploding_driver() -> Result<Arc<BatchState>, BatchError> {
        panic!("driver blew up")
    }

    #[tokio::test]
    async fn test_panicked_driver_surfaces_as_invariant() {
        let state = Arc::new(BatchState::new(
            BatchId::from("batch-panic"),
            &ids(&["a", "b"]),
        ));
        let handle = BatchHandle {
            state: Arc::clone(&state),
            cancel: CancellationToken::new(),
            join: tokio::spawn(exploding_driver()),
        };

        let err = handle.join().await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::Invariant(InvariantViolation::Aborted { .. })
        ));
        assert_eq!(state.status(), BatchStatus::Cancelled);
        assert_eq!(state.snapshot().failed, 2);
    }

    #[tokio::test]
    async fn test_drain_cancels_abandons_slow_requests() {
        let slow = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let started = std::time::Instant::now();
        drain_cancels(vec![slow], Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
