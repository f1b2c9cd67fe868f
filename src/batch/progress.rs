//! Background progress monitor for a running batch.
//!
//! Periodically logs batch counters (completed, passed, failed, pass rate)
//! so operators can follow long evaluation runs without parsing individual
//! task log lines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::BatchState;

/// A background task that periodically logs batch progress.
///
/// Stops on its own once the batch leaves Running, or when
/// [`ProgressMonitor::stop`] is called.
pub struct ProgressMonitor {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a monitor that logs every `interval`.
    pub fn start(state: Arc<BatchState>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let snap = state.snapshot();
                let elapsed_secs = start.elapsed().as_secs_f64();
                let pct = if snap.total > 0 {
                    snap.completed as f64 / snap.total as f64 * 100.0
                } else {
                    100.0
                };
                let tasks_per_min = if elapsed_secs > 0.0 {
                    snap.completed as f64 / elapsed_secs * 60.0
                } else {
                    0.0
                };

                tracing::info!(
                    batch_id = %snap.batch_id,
                    completed = snap.completed,
                    total = snap.total,
                    passed = snap.passed,
                    failed = snap.failed,
                    progress_pct = format!("{:.1}%", pct),
                    pass_rate = format!("{:.3}", snap.pass_rate),
                    tasks_per_min = format!("{:.2}", tasks_per_min),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Batch progress"
                );

                if snap.status.is_finished() {
                    break;
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchId, Outcome, TaskId};

    #[tokio::test]
    async fn test_progress_monitor_start_stop() {
        let state = Arc::new(BatchState::new(
            BatchId::from("batch-progress"),
            &[TaskId::from("a"), TaskId::from("b")],
        ));
        state
            .record(&TaskId::from("a"), Outcome::Passed, Duration::ZERO)
            .unwrap();

        let monitor = ProgressMonitor::start(Arc::clone(&state), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(70)).await;
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_progress_monitor_exits_when_batch_finishes() {
        let state = Arc::new(BatchState::new(
            BatchId::from("batch-progress-done"),
            &[TaskId::from("a")],
        ));
        state
            .record(&TaskId::from("a"), Outcome::Passed, Duration::ZERO)
            .unwrap();
        state.finalize().unwrap();

        let mut monitor = ProgressMonitor::start(state, Duration::from_millis(10));
        let handle = monitor.handle.take().unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should stop on its own")
            .unwrap();
    }
}
