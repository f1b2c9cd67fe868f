//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library users that never expose metrics pay nothing.

use prometheus::Gauge;

use super::prometheus::{
    ACTIVE_PIPELINES, BATCHES_RUNNING, BATCHES_TOTAL, CANCEL_FAILURES, TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for recording fleet operational metrics.
///
/// # Example
///
/// ```ignore
/// use bench_fleet::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task("passed", 42.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one task outcome and its pipeline duration.
    pub fn record_task(&self, outcome: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[outcome]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration.observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Counts one active pipeline until the guard is dropped, including
    /// when the owning task is aborted.
    pub fn pipeline_guard(&self) -> PipelineGuard {
        PipelineGuard::on(ACTIVE_PIPELINES.get().cloned())
    }

    pub fn batch_started(&self) {
        if let Some(running) = BATCHES_RUNNING.get() {
            running.inc();
        }
    }

    /// Record a batch reaching its final status.
    pub fn batch_finished(&self, status: &str) {
        if let Some(running) = BATCHES_RUNNING.get() {
            running.dec();
        }
        if let Some(batches_total) = BATCHES_TOTAL.get() {
            batches_total.with_label_values(&[status]).inc();
        }
        tracing::trace!(status = status, "Recorded batch metric");
    }

    pub fn record_cancel_failure(&self) {
        if let Some(failures) = CANCEL_FAILURES.get() {
            failures.inc();
        }
    }
}

/// Holds one slot of the active pipelines gauge.
#[derive(Debug)]
pub struct PipelineGuard {
    gauge: Option<Gauge>,
}

impl PipelineGuard {
    fn on(gauge: Option<Gauge>) -> Self {
        if let Some(gauge) = &gauge {
            gauge.inc();
        }
        Self { gauge }
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        if let Some(gauge) = &self.gauge {
            gauge.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_record_task() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();
        collector.record_task("passed", 12.5);
        collector.record_task("timed_out", 1800.0);

        let count = TASKS_TOTAL
            .get()
            .map(|c| c.with_label_values(&["timed_out"]).get())
            .unwrap_or_default();
        assert!(count >= 1.0);
    }

    #[test]
    fn test_pipeline_guard_round_trip() {
        let gauge = Gauge::new("test_active_pipelines", "test gauge").unwrap();
        let guard = PipelineGuard::on(Some(gauge.clone()));
        assert_eq!(gauge.get(), 1.0);
        drop(guard);
        assert_eq!(gauge.get(), 0.0);

        // Before init the guard is inert.
        drop(PipelineGuard::on(None));
    }

    #[tokio::test]
    async fn test_pipeline_guard_released_on_abort() {
        let gauge = Gauge::new("test_aborted_pipelines", "test gauge").unwrap();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let held = gauge.clone();
        let task = tokio::spawn(async move {
            let _guard = PipelineGuard::on(Some(held));
            let _ = entered_tx.send(());
            futures::future::pending::<()>().await;
        });

        entered_rx.await.unwrap();
        assert_eq!(gauge.get(), 1.0);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(gauge.get(), 0.0);
    }

    #[test]
    fn test_batch_and_cancel_metrics() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();
        collector.batch_started();
        collector.batch_finished("completed");
        collector.record_cancel_failure();

        let completed = BATCHES_TOTAL
            .get()
            .map(|c| c.with_label_values(&["completed"]).get())
            .unwrap_or_default();
        assert!(completed >= 1.0);
    }
}
