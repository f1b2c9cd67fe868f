//! Terminal classification of a single task.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a prober reports once an execution reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(String),
}

impl From<Verdict> for Outcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Passed => Outcome::Passed,
            Verdict::Failed(reason) => Outcome::Failed { reason },
        }
    }
}

/// The one outcome recorded per task per batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The task ran and passed.
    Passed,
    /// The task ran and did not pass.
    Failed { reason: String },
    /// The per-task deadline expired before a terminal state was observed.
    TimedOut,
    /// The launcher could not start the execution.
    LaunchFailed { error: String },
    /// The prober could not determine the terminal state.
    ProbeError { error: String },
    /// The batch was cancelled before this task finished.
    Cancelled,
}

impl Outcome {
    /// Only `Passed` counts towards the pass counter.
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    /// True when the infrastructure, not the task, failed.
    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(self, Outcome::LaunchFailed { .. } | Outcome::ProbeError { .. })
    }

    /// Short label used in metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed { .. } => "failed",
            Outcome::TimedOut => "timed_out",
            Outcome::LaunchFailed { .. } => "launch_failed",
            Outcome::ProbeError { .. } => "probe_error",
            Outcome::Cancelled => "cancelled",
        }
    }

    /// Error or failure reason carried by the outcome, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Outcome::Failed { reason } => Some(reason),
            Outcome::LaunchFailed { error } | Outcome::ProbeError { error } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {}", self.label(), msg),
            None => f.write_str(self.label()),
        }
    }
}

/// Persisted per-task detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Wall-clock time from slot acquisition to outcome.
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(outcome: Outcome, duration: Duration) -> Self {
        Self {
            outcome,
            duration_ms: duration.as_millis() as u64,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_passed_counts_as_passed() {
        assert!(Outcome::Passed.is_passed());
        assert!(!Outcome::TimedOut.is_passed());
        assert!(!Outcome::Cancelled.is_passed());
        assert!(!Outcome::Failed { reason: "x".into() }.is_passed());
    }

    #[test]
    fn test_infrastructure_failures() {
        assert!(Outcome::LaunchFailed { error: "boom".into() }.is_infrastructure_failure());
        assert!(Outcome::ProbeError { error: "lost".into() }.is_infrastructure_failure());
        assert!(!Outcome::TimedOut.is_infrastructure_failure());
        assert!(!Outcome::Failed { reason: "tests".into() }.is_infrastructure_failure());
    }

    #[test]
    fn test_verdict_conversion() {
        assert_eq!(Outcome::from(Verdict::Passed), Outcome::Passed);
        assert_eq!(
            Outcome::from(Verdict::Failed("exit code 1".into())),
            Outcome::Failed {
                reason: "exit code 1".into()
            }
        );
    }

    #[test]
    fn test_task_record_serialization() {
        let record = TaskRecord::new(
            Outcome::LaunchFailed {
                error: "no capacity".into(),
            },
            Duration::from_millis(1500),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "launch_failed");
        assert_eq!(json["error"], "no capacity");
        assert_eq!(json["duration_ms"], 1500);

        let back: TaskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::TimedOut.to_string(), "timed_out");
        assert_eq!(
            Outcome::Failed {
                reason: "exit code 2".into()
            }
            .to_string(),
            "failed: exit code 2"
        );
    }
}
