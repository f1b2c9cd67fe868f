//! The launch → probe → record pipeline for a single task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::adapter::{
    deadline_after, ExecutionHandle, LaunchConfig, LaunchRequest, Launcher, Prober,
};
use crate::batch::{BatchState, Outcome, TaskId};
use crate::error::{InvariantViolation, ProbeError};
use crate::metrics::MetricsCollector;

/// What a finished worker hands back to the scheduler.
pub(crate) struct WorkerReport {
    /// Outstanding fire-and-forget cancellation for this task, if any.
    pub cancel_request: Option<JoinHandle<()>>,
}

/// Everything one task pipeline needs. Cheap to clone per task.
#[derive(Clone)]
pub(crate) struct Worker {
    pub batch: Arc<BatchState>,
    pub launcher: Arc<dyn Launcher>,
    pub prober: Arc<dyn Prober>,
    pub launch_config: Arc<LaunchConfig>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub metrics: MetricsCollector,
}

enum ProbeStep {
    Cancelled,
    Elapsed,
    Panicked(String),
    Done(Result<crate::batch::Verdict, ProbeError>),
}

impl Worker {
    /// Runs one task to its outcome. The permit is released when this
    /// returns.
    pub async fn run(
        self,
        task_id: TaskId,
        permit: OwnedSemaphorePermit,
    ) -> Result<WorkerReport, InvariantViolation> {
        let span = tracing::info_span!(
            "task",
            batch_id = %self.batch.batch_id(),
            task_id = %task_id
        );
        async move {
            let started = Instant::now();
            let deadline = deadline_after(started, self.timeout);
            let pipeline = self.metrics.pipeline_guard();

            let (outcome, to_cancel) = self.execute(&task_id, deadline).await;
            let duration = started.elapsed();

            drop(pipeline);
            drop(permit);

            let cancel_request = to_cancel.map(|handle| self.request_cancel(handle));

            match &outcome {
                Outcome::Passed => info!(duration_ms = duration.as_millis() as u64, "Task passed"),
                Outcome::Failed { reason } => {
                    info!(duration_ms = duration.as_millis() as u64, reason = %reason, "Task failed")
                }
                Outcome::TimedOut => warn!(
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Task timed out"
                ),
                Outcome::Cancelled => info!("Task cancelled"),
                Outcome::LaunchFailed { error } | Outcome::ProbeError { error } => warn!(
                    outcome = outcome.label(),
                    error = %error,
                    "Task infrastructure failure"
                ),
            }
            self.metrics
                .record_task(outcome.label(), duration.as_secs_f64());

            let progress = self
                .batch
                .record(&task_id, outcome, duration)
                .inspect_err(|e| error!(error = %e, "Failed to record task outcome"))?;
            debug!(
                completed = progress.completed,
                total = progress.total,
                "Recorded task outcome"
            );

            Ok(WorkerReport { cancel_request })
        }
        .instrument(span)
        .await
    }

    /// Returns the outcome and, when the execution may still be running, the
    /// handle that should be cancelled.
    async fn execute(
        &self,
        task_id: &TaskId,
        deadline: Instant,
    ) -> (Outcome, Option<ExecutionHandle>) {
        let request = LaunchRequest {
            batch_id: self.batch.batch_id(),
            task_id,
            config: self.launch_config.as_ref(),
        };

        let launch = AssertUnwindSafe(self.launcher.launch(request)).catch_unwind();
        let launched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return (Outcome::Cancelled, None),
            result = tokio::time::timeout_at(deadline, launch) => result,
        };

        let handle = match launched {
            Err(_) => return (Outcome::TimedOut, None),
            Ok(Err(payload)) => {
                let error = format!("launcher panicked: {}", panic_message(payload));
                error!(error = %error, "Launcher panicked");
                return (Outcome::LaunchFailed { error }, None);
            }
            Ok(Ok(Err(e))) => {
                return (
                    Outcome::LaunchFailed {
                        error: e.to_string(),
                    },
                    None,
                )
            }
            Ok(Ok(Ok(handle))) => handle,
        };
        debug!(token = handle.token(), "Launched");

        let remaining = deadline.saturating_duration_since(Instant::now());
        let step = {
            let probe = AssertUnwindSafe(self.prober.probe(&handle, remaining)).catch_unwind();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => ProbeStep::Cancelled,
                result = tokio::time::timeout_at(deadline, probe) => match result {
                    Err(_) => ProbeStep::Elapsed,
                    Ok(Err(payload)) => ProbeStep::Panicked(panic_message(payload)),
                    Ok(Ok(result)) => ProbeStep::Done(result),
                },
            }
        };

        match step {
            ProbeStep::Cancelled => (Outcome::Cancelled, Some(handle)),
            ProbeStep::Elapsed | ProbeStep::Done(Err(ProbeError::Timeout(_))) => {
                (Outcome::TimedOut, Some(handle))
            }
            ProbeStep::Panicked(message) => {
                let error = format!("prober panicked: {}", message);
                error!(error = %error, "Prober panicked");
                // The execution itself may still be running.
                (Outcome::ProbeError { error }, Some(handle))
            }
            ProbeStep::Done(Err(e)) => (
                Outcome::ProbeError {
                    error: e.to_string(),
                },
                None,
            ),
            ProbeStep::Done(Ok(verdict)) => (verdict.into(), None),
        }
    }

    /// Issues one cancellation without waiting for it. Failures are logged.
    fn request_cancel(&self, handle: ExecutionHandle) -> JoinHandle<()> {
        let launcher = Arc::clone(&self.launcher);
        let metrics = self.metrics.clone();
        tokio::spawn(
            async move {
                match launcher.cancel(&handle).await {
                    Ok(()) => debug!(token = handle.token(), "Cancellation requested"),
                    Err(e) => {
                        metrics.record_cancel_failure();
                        warn!(token = handle.token(), error = %e, "Cancellation request failed");
                    }
                }
            }
            .in_current_span(),
        )
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
