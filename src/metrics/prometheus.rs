//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by bench-fleet and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all bench-fleet metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of task outcomes recorded, labeled by outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task pipeline duration in seconds, from slot acquisition to outcome.
pub static TASK_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of launch/probe pipelines currently holding a slot.
pub static ACTIVE_PIPELINES: OnceLock<Gauge> = OnceLock::new();

/// Total batches finished, labeled by final status.
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of batches currently running.
pub static BATCHES_RUNNING: OnceLock<Gauge> = OnceLock::new();

/// Cancellation requests that failed.
pub static CANCEL_FAILURES: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Repeated calls are harmless: the first registry
/// wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due
/// to duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("bench_fleet_tasks_total", "Total task outcomes recorded"),
        &["outcome"],
    )?;

    let task_duration = Histogram::with_opts(
        HistogramOpts::new(
            "bench_fleet_task_duration_seconds",
            "Task pipeline duration in seconds",
        )
        .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]),
    )?;

    let active_pipelines = Gauge::new(
        "bench_fleet_active_pipelines",
        "Number of launch/probe pipelines currently holding a slot",
    )?;

    let batches_total = CounterVec::new(
        Opts::new("bench_fleet_batches_total", "Total batches finished"),
        &["status"],
    )?;

    let batches_running = Gauge::new("bench_fleet_batches_running", "Number of running batches")?;

    let cancel_failures = Counter::new(
        "bench_fleet_cancel_failures_total",
        "Cancellation requests that failed",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(active_pipelines.clone()))?;
    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(batches_running.clone()))?;
    registry.register(Box::new(cancel_failures.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = ACTIVE_PIPELINES.set(active_pipelines);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = BATCHES_RUNNING.set(batches_running);
    let _ = CANCEL_FAILURES.set(cancel_failures);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry is not
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
