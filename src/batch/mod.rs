//! Batch data model and shared aggregate state.
//!
//! A batch is one request to run a set of independent tasks with bounded
//! concurrency. This module holds the identifiers, the per-task
//! [`Outcome`] classification, and the [`BatchState`] aggregate that
//! workers write into and status pollers read from.
//!
//! # Lifecycle
//!
//! ```text
//! create (Running, counters zero)
//!    │  record(task, outcome)  × total
//!    ▼
//! finalize (Completed, ended_at stamped, immutable)
//! ```
//!
//! A batch-level cancellation seals the state as `Cancelled` instead, with
//! every unrecorded task filled in as [`Outcome::Cancelled`].

pub mod outcome;
pub mod progress;
pub mod state;

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use outcome::{Outcome, TaskRecord, Verdict};
pub use progress::ProgressMonitor;
pub use state::{BatchSnapshot, BatchState, BatchStatus, RecordProgress, SNAPSHOT_SCHEMA_VERSION};

/// Identifier of one task within a batch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one batch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Generates a fresh identifier: `batch_<date>_<time>_<8 hex>`.
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("batch_{}_{}", stamp, &suffix[..8]))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
