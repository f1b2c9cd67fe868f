//! Fleet configuration.
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! an optional YAML file, and `FLEET_*` environment variables. Command-line
//! flags are applied on top by the CLI.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterConfig, AdapterKind, LaunchConfig};
use crate::error::ConfigError;
use crate::scheduler::BatchOptions;

/// Scheduling defaults for every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tasks in flight at once when a request does not say otherwise.
    pub concurrency: usize,
    /// Upper bound a request may ask for.
    pub max_concurrency: usize,
    /// Per-task deadline covering launch and probe.
    pub task_timeout_secs: u64,
    /// Grace period for outstanding cancellations.
    pub cancel_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_concurrency: 50,
            task_timeout_secs: 1800, // 30 minutes
            cancel_grace_secs: 30,
        }
    }
}

/// HTTP service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// How long finished batches stay queryable.
    pub retention_secs: u64,
    /// How often expired batches are swept.
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            retention_secs: 24 * 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub scheduler: SchedulerConfig,
    pub launch: LaunchConfig,
    pub adapter: AdapterConfig,
    pub server: ServerConfig,
    /// Where finished batch results are written.
    pub results_dir: PathBuf,
    /// Interval between progress log lines during CLI runs.
    pub progress_interval_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            launch: LaunchConfig::default(),
            adapter: AdapterConfig::default(),
            server: ServerConfig::default(),
            results_dir: PathBuf::from("./fleet-results"),
            progress_interval_secs: 30,
        }
    }
}

impl FleetConfig {
    /// Defaults, then `path` if given, then the process environment.
    /// The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `FLEET_CONCURRENCY`: Default concurrency (default: 10)
    /// - `FLEET_MAX_CONCURRENCY`: Largest concurrency a request may ask for (default: 50)
    /// - `FLEET_TASK_TIMEOUT_SECS`: Per-task timeout in seconds (default: 1800)
    /// - `FLEET_CANCEL_GRACE_SECS`: Cancellation grace period in seconds (default: 30)
    /// - `FLEET_MODEL`, `FLEET_AGENT`, `FLEET_DATASET`: Launch parameters
    /// - `FLEET_ADAPTER`: `local`, `container`, `remote`, `vm_fleet` or `scripted`
    /// - `FLEET_RUNNER_COMMAND`: Whitespace-separated local command template
    /// - `FLEET_OUTPUT_ROOT`: Local adapter output root
    /// - `FLEET_IMAGE`: Container image
    /// - `FLEET_KEEP_CONTAINERS`: Keep finished containers (boolean)
    /// - `FLEET_REMOTE_URL`, `FLEET_REMOTE_TOKEN`: Remote function service
    /// - `FLEET_VM_REGION`, `FLEET_VM_IMAGE_ID`, `FLEET_VM_INSTANCE_TYPE`, `FLEET_VM_SPOT`,
    ///   `FLEET_VM_RESULTS_BUCKET`: VM fleet adapter
    /// - `FLEET_BIND`: HTTP bind address (default: 0.0.0.0:8080)
    /// - `FLEET_RETENTION_SECS`: Finished batch retention (default: 86400)
    /// - `FLEET_RESULTS_DIR`: Result directory (default: ./fleet-results)
    /// - `FLEET_PROGRESS_INTERVAL_SECS`: Progress log interval (default: 30)
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env`](Self::apply_env) with an explicit lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("FLEET_CONCURRENCY") {
            self.scheduler.concurrency = parse_env_value(&val, "FLEET_CONCURRENCY")?;
        }
        if let Some(val) = lookup("FLEET_MAX_CONCURRENCY") {
            self.scheduler.max_concurrency = parse_env_value(&val, "FLEET_MAX_CONCURRENCY")?;
        }
        if let Some(val) = lookup("FLEET_TASK_TIMEOUT_SECS") {
            self.scheduler.task_timeout_secs = parse_env_value(&val, "FLEET_TASK_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("FLEET_CANCEL_GRACE_SECS") {
            self.scheduler.cancel_grace_secs = parse_env_value(&val, "FLEET_CANCEL_GRACE_SECS")?;
        }

        if let Some(val) = lookup("FLEET_MODEL") {
            self.launch.model = val;
        }
        if let Some(val) = lookup("FLEET_AGENT") {
            self.launch.agent = val;
        }
        if let Some(val) = lookup("FLEET_DATASET") {
            self.launch.dataset = val;
        }

        if let Some(val) = lookup("FLEET_ADAPTER") {
            self.adapter.kind = val.parse()?;
        }
        if let Some(val) = lookup("FLEET_RUNNER_COMMAND") {
            self.adapter.local.command = val.split_whitespace().map(String::from).collect();
        }
        if let Some(val) = lookup("FLEET_OUTPUT_ROOT") {
            self.adapter.local.output_root = PathBuf::from(val);
        }
        if let Some(val) = lookup("FLEET_IMAGE") {
            self.adapter.container.image = val;
        }
        if let Some(val) = lookup("FLEET_KEEP_CONTAINERS") {
            self.adapter.container.keep_containers = parse_env_bool(&val, "FLEET_KEEP_CONTAINERS")?;
        }
        if let Some(val) = lookup("FLEET_REMOTE_URL") {
            self.adapter.remote.base_url = val;
        }
        if let Some(val) = lookup("FLEET_REMOTE_TOKEN") {
            self.adapter.remote.api_token = Some(val);
        }
        if let Some(val) = lookup("FLEET_VM_REGION") {
            self.adapter.vm_fleet.region = Some(val);
        }
        if let Some(val) = lookup("FLEET_VM_IMAGE_ID") {
            self.adapter.vm_fleet.image_id = val;
        }
        if let Some(val) = lookup("FLEET_VM_INSTANCE_TYPE") {
            self.adapter.vm_fleet.instance_type = val;
        }
        if let Some(val) = lookup("FLEET_VM_SPOT") {
            self.adapter.vm_fleet.spot = parse_env_bool(&val, "FLEET_VM_SPOT")?;
        }
        if let Some(val) = lookup("FLEET_VM_RESULTS_BUCKET") {
            self.adapter.vm_fleet.results_bucket = val;
        }

        if let Some(val) = lookup("FLEET_BIND") {
            self.server.bind = val;
        }
        if let Some(val) = lookup("FLEET_RETENTION_SECS") {
            self.server.retention_secs = parse_env_value(&val, "FLEET_RETENTION_SECS")?;
        }
        if let Some(val) = lookup("FLEET_RESULTS_DIR") {
            self.results_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("FLEET_PROGRESS_INTERVAL_SECS") {
            self.progress_interval_secs = parse_env_value(&val, "FLEET_PROGRESS_INTERVAL_SECS")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.max_concurrency".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(0));
        }
        if self.scheduler.concurrency > self.scheduler.max_concurrency {
            return Err(ConfigError::ConcurrencyTooHigh {
                requested: self.scheduler.concurrency,
                max: self.scheduler.max_concurrency,
            });
        }
        if self.scheduler.task_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }

        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                key: "server.bind".to_string(),
                message: format!("'{}' is not a socket address", self.server.bind),
            });
        }
        if self.server.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.sweep_interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.progress_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "progress_interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        match self.adapter.kind {
            AdapterKind::Local if self.adapter.local.command.is_empty() => {
                Err(ConfigError::InvalidValue {
                    key: "adapter.local.command".to_string(),
                    message: "cannot be empty".to_string(),
                })
            }
            AdapterKind::Container if self.adapter.container.image.is_empty() => {
                Err(ConfigError::InvalidValue {
                    key: "adapter.container.image".to_string(),
                    message: "cannot be empty".to_string(),
                })
            }
            AdapterKind::Remote if self.adapter.remote.base_url.trim().is_empty() => {
                Err(ConfigError::InvalidValue {
                    key: "adapter.remote.base_url".to_string(),
                    message: "must be set for the remote adapter".to_string(),
                })
            }
            AdapterKind::VmFleet => self.adapter.vm_fleet.validate(),
            _ => Ok(()),
        }
    }

    /// Batch options derived from the scheduler and launch sections.
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions::new(self.scheduler.concurrency)
            .with_per_task_timeout(Duration::from_secs(self.scheduler.task_timeout_secs))
            .with_cancel_grace(Duration::from_secs(self.scheduler.cancel_grace_secs))
            .with_launch(self.launch.clone())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.server.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.server.sweep_interval_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
