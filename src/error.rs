//! Error types for bench-fleet operations.
//!
//! Defines the error taxonomy used across the crate:
//! - Configuration errors (fatal, rejected before any work starts)
//! - Per-task launch and probe errors (converted into outcomes)
//! - Invariant violations on batch state (programming errors)
//! - Result persistence and registry lookups

use std::time::Duration;

use thiserror::Error;

use crate::batch::{BatchId, TaskId};

/// Errors raised while validating configuration or batch options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("Concurrency {requested} exceeds the allowed maximum of {max}")]
    ConcurrencyTooHigh { requested: usize, max: usize },

    #[error("Per-task timeout must be greater than zero")]
    InvalidTimeout,

    #[error("Task identifiers must be non-empty")]
    EmptyTaskId,

    #[error("Task '{0}' appears more than once in the batch")]
    DuplicateTask(String),

    #[error("No tasks specified")]
    NoTasks,

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown adapter '{0}': expected local, container, remote, vm_fleet or scripted")]
    UnknownAdapter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A task execution could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Launch rejected: {0}")]
    Rejected(String),

    #[error("Failed to spawn task runner: {0}")]
    Spawn(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Waiting for a task execution failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution handle '{0}' is unknown to this adapter")]
    UnknownHandle(String),

    #[error("Execution lost: {0}")]
    Lost(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A best-effort cancellation request failed.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("Execution handle '{0}' is unknown to this adapter")]
    UnknownHandle(String),

    #[error("Cancel request failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A batch state invariant was broken. Always a programming error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("Task '{task_id}' already has an outcome in batch '{batch_id}'")]
    DuplicateRecord { batch_id: BatchId, task_id: TaskId },

    #[error("Task '{task_id}' is not part of batch '{batch_id}'")]
    UnknownTask { batch_id: BatchId, task_id: TaskId },

    #[error("Batch '{batch_id}' is sealed; cannot record task '{task_id}'")]
    Sealed { batch_id: BatchId, task_id: TaskId },

    #[error("Batch '{batch_id}' cannot be finalized with {completed} of {total} tasks recorded")]
    Incomplete {
        batch_id: BatchId,
        completed: usize,
        total: usize,
    },

    #[error("Batch '{batch_id}' driver stopped unexpectedly: {reason}")]
    Aborted { batch_id: BatchId, reason: String },
}

/// Errors that escape a batch run.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// Errors that can occur while persisting or reading batch results.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Result for batch '{0}' not found")]
    NotFound(String),

    #[error("Batch id '{0}' cannot be used as a file name")]
    InvalidBatchId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by the active-batches table.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Batch '{0}' not found")]
    NotFound(BatchId),

    #[error(transparent)]
    Batch(#[from] BatchError),
}
