//! Per-batch scheduling options and their validation.

use std::collections::HashSet;
use std::time::Duration;

use crate::adapter::LaunchConfig;
use crate::batch::TaskId;
use crate::error::ConfigError;

/// Options for one batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Maximum number of tasks in flight at once.
    pub concurrency: usize,
    /// Budget for one task, from slot acquisition through launch and probe.
    pub per_task_timeout: Duration,
    /// How long to wait for outstanding cancellations and, on a batch-level
    /// cancel, for in-flight workers.
    pub cancel_grace: Duration,
    /// Parameters forwarded to every launch.
    pub launch: LaunchConfig,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            per_task_timeout: Duration::from_secs(1800), // 30 minutes
            cancel_grace: Duration::from_secs(30),
            launch: LaunchConfig::default(),
        }
    }
}

impl BatchOptions {
    /// Creates options with the given concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Sets the concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the per-task timeout.
    pub fn with_per_task_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    /// Sets the cancellation grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Sets the launch parameters.
    pub fn with_launch(mut self, launch: LaunchConfig) -> Self {
        self.launch = launch;
        self
    }

    /// Checks the options and the task list. Nothing has been launched when
    /// this fails.
    pub fn validate(&self, task_ids: &[TaskId]) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }
        if self.per_task_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }

        let mut seen = HashSet::with_capacity(task_ids.len());
        for task_id in task_ids {
            if task_id.as_str().trim().is_empty() {
                return Err(ConfigError::EmptyTaskId);
            }
            if !seen.insert(task_id) {
                return Err(ConfigError::DuplicateTask(task_id.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<TaskId> {
        raw.iter().map(|s| TaskId::from(*s)).collect()
    }

    #[test]
    fn test_defaults() {
        let options = BatchOptions::default();
        assert_eq!(options.concurrency, 10);
        assert_eq!(options.per_task_timeout, Duration::from_secs(1800));
        assert!(options.validate(&ids(&["a", "b"])).is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let options = BatchOptions::new(0);
        assert!(matches!(
            options.validate(&ids(&["a"])),
            Err(ConfigError::InvalidConcurrency(0))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let options = BatchOptions::default().with_per_task_timeout(Duration::ZERO);
        assert!(matches!(
            options.validate(&ids(&["a"])),
            Err(ConfigError::InvalidTimeout)
        ));
    }

    #[test]
    fn test_duplicate_and_empty_ids_rejected() {
        let options = BatchOptions::default();
        assert!(matches!(
            options.validate(&ids(&["a", "b", "a"])),
            Err(ConfigError::DuplicateTask(ref id)) if id == "a"
        ));
        assert!(matches!(
            options.validate(&ids(&["a", " "])),
            Err(ConfigError::EmptyTaskId)
        ));
    }

    #[test]
    fn test_empty_task_list_is_valid() {
        assert!(BatchOptions::default().validate(&[]).is_ok());
    }
}
