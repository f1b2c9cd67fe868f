//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks task outcomes, pipeline durations, slot occupancy and batch
//! lifecycle. Served on `GET /metrics` by the HTTP API.
//!
//! # Example
//!
//! ```ignore
//! use bench_fleet::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_task("passed", 120.5);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_PIPELINES, BATCHES_RUNNING, BATCHES_TOTAL, CANCEL_FAILURES, REGISTRY, TASKS_TOTAL,
    TASK_DURATION,
};
