//! Virtual machine fleet adapter.
//!
//! Each task boots one instance whose user data runs the task runner,
//! uploads `results.json` to object storage and shuts the machine down.
//! Launch is run-instance, probe polls the instance lifecycle state until
//! it is on its way down and then picks the results up, cancel terminates.
//!
//! The cloud API sits behind [`InstanceBackend`]. The EC2/S3 backend lives
//! in [`super::ec2`] and needs the `ec2` feature.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::local::passed_from_results;
use super::poll::{poll_until, PollPolicy};
use super::{render_template, sanitize_name, ExecutionHandle, LaunchRequest, Launcher, Prober};
use crate::batch::Verdict;
use crate::error::{CancelError, ConfigError, LaunchError, ProbeError};

const DEFAULT_USER_DATA: &str = r#"#!/bin/bash
set -e
exec > >(tee /var/log/user-data.log) 2>&1

{env_exports}
yum install -y docker python3-pip
service docker start
pip3 install awscli terminal-bench

tb run --dataset {dataset} --task-id {task_id} --agent {agent} --model {model} \
  --output-path /tmp/results || true

RESULTS=$(find /tmp/results -name results.json | head -n 1)
if [ -n "$RESULTS" ]; then
  aws s3 cp "$RESULTS" "{results_uri}"
fi
aws s3 cp /tmp/results "{logs_uri}" --recursive || true

shutdown -h now
"#;

/// Configuration for [`VmFleetAdapter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmFleetConfig {
    /// Cloud region; the SDK default chain decides when unset.
    pub region: Option<String>,
    /// Machine image every instance boots from.
    pub image_id: String,
    pub instance_type: String,
    /// Request one-time spot capacity instead of on-demand.
    pub spot: bool,
    /// Instance profile granting write access to the results bucket.
    pub iam_instance_profile: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    /// Bucket the instances upload their results to.
    pub results_bucket: String,
    /// Key prefix under the bucket; results land at
    /// `<prefix>/<batch>/<task>/results.json`.
    pub results_prefix: String,
    /// Boot script. Takes the usual launch placeholders plus
    /// `{env_exports}`, `{results_uri}` and `{logs_uri}`.
    pub user_data: String,
    /// Terminate instances that stopped instead of terminating themselves.
    pub terminate_on_finish: bool,
    pub poll: PollPolicy,
}

impl Default for VmFleetConfig {
    fn default() -> Self {
        Self {
            region: None,
            image_id: "ami-0c02fb55731490381".to_string(), // Amazon Linux 2
            instance_type: "t3.small".to_string(),
            spot: true,
            iam_instance_profile: None,
            subnet_id: None,
            security_group_ids: Vec::new(),
            results_bucket: String::new(),
            results_prefix: "fleet-results".to_string(),
            user_data: DEFAULT_USER_DATA.to_string(),
            terminate_on_finish: true,
            poll: PollPolicy {
                initial_interval_ms: 5_000,
                max_interval_ms: 30_000,
                ..Default::default()
            },
        }
    }
}

impl VmFleetConfig {
    pub fn new(results_bucket: impl Into<String>) -> Self {
        Self {
            results_bucket: results_bucket.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = image_id.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_user_data(mut self, user_data: impl Into<String>) -> Self {
        self.user_data = user_data.into();
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Checks the settings every launch depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "adapter.vm_fleet.image_id".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.instance_type.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "adapter.vm_fleet.instance_type".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.results_bucket.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "adapter.vm_fleet.results_bucket".to_string(),
                message: "must be set for the vm_fleet adapter".to_string(),
            });
        }
        Ok(())
    }

    fn task_prefix(&self, batch_id: &str, task_id: &str) -> String {
        let prefix = self.results_prefix.trim_matches('/');
        let path = format!("{}/{}", sanitize_name(batch_id), sanitize_name(task_id));
        if prefix.is_empty() {
            path
        } else {
            format!("{}/{}", prefix, path)
        }
    }
}

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// True once the boot script is done with the machine.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            InstanceState::ShuttingDown | InstanceState::Terminated | InstanceState::Stopped
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What the backend needs to boot one task's instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequest {
    /// Value of the `Name` tag.
    pub name: String,
    pub batch_id: String,
    pub task_id: String,
    /// Rendered boot script, not yet encoded.
    pub user_data: String,
}

/// Cloud operations the fleet adapter is built on.
#[async_trait]
pub trait InstanceBackend: Send + Sync {
    /// Boots one instance and returns its id.
    async fn run_instance(&self, request: &InstanceRequest) -> Result<String, LaunchError>;

    /// Current state, or `None` when the API does not (yet) know the id.
    async fn describe_instance(&self, instance_id: &str)
        -> Result<Option<InstanceState>, ProbeError>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), CancelError>;

    /// Reads an uploaded object. `None` when it does not exist.
    async fn fetch_object(&self, key: &str) -> Result<Option<Vec<u8>>, ProbeError>;
}

/// Runs each task on its own virtual machine.
pub struct VmFleetAdapter {
    config: VmFleetConfig,
    backend: Arc<dyn InstanceBackend>,
    /// Instance id -> results object key.
    instances: Mutex<HashMap<String, String>>,
}

impl VmFleetAdapter {
    pub fn new(config: VmFleetConfig, backend: Arc<dyn InstanceBackend>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            backend,
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// Instances launched and not yet probed to completion or cancelled.
    pub fn tracked(&self) -> usize {
        self.instances().len()
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render_user_data(&self, request: &LaunchRequest<'_>, task_prefix: &str) -> String {
        let bucket = self.config.results_bucket.trim();
        let mut vars = request.template_vars();
        vars.push(("env_exports", env_exports(request)));
        vars.push((
            "results_uri",
            format!("s3://{}/{}/results.json", bucket, task_prefix),
        ));
        vars.push(("logs_uri", format!("s3://{}/{}/logs/", bucket, task_prefix)));
        render_template(std::slice::from_ref(&self.config.user_data), &vars)
            .pop()
            .unwrap_or_default()
    }

    async fn wait_until_down(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceState, ProbeError> {
        poll_until(&self.config.poll, timeout, || async move {
            match self.backend.describe_instance(instance_id).await? {
                // Fresh ids can take a moment to show up; count it against
                // the transport error budget.
                None => Err(ProbeError::Transport(format!(
                    "instance {} not visible",
                    instance_id
                ))),
                Some(state) if state.is_finished() => Ok(Some(state)),
                Some(state) => {
                    debug!(instance_id, state = %state, "Instance still up");
                    Ok(None)
                }
            }
        })
        .await
    }
}

fn env_exports(request: &LaunchRequest<'_>) -> String {
    let mut lines: Vec<String> = request
        .config
        .env
        .iter()
        .map(|(key, value)| format!("export {}={}", key, shell_quote(value)))
        .collect();
    lines.push(format!("export TASK_ID={}", shell_quote(request.task_id.as_str())));
    lines.push(format!("export BATCH_ID={}", shell_quote(request.batch_id.as_str())));
    lines.join("\n")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl Launcher for VmFleetAdapter {
    fn name(&self) -> &'static str {
        "vm_fleet"
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<ExecutionHandle, LaunchError> {
        let task_prefix = self
            .config
            .task_prefix(request.batch_id.as_str(), request.task_id.as_str());
        let instance = InstanceRequest {
            name: format!("fleet-{}", request.task_id),
            batch_id: request.batch_id.to_string(),
            task_id: request.task_id.to_string(),
            user_data: self.render_user_data(&request, &task_prefix),
        };

        let instance_id = self.backend.run_instance(&instance).await?;
        if instance_id.is_empty() {
            return Err(LaunchError::Rejected(
                "run-instance returned no instance id".to_string(),
            ));
        }
        debug!(task_id = %request.task_id, instance_id = %instance_id, "Launched instance");
        self.instances()
            .insert(instance_id.clone(), format!("{}/results.json", task_prefix));
        Ok(ExecutionHandle::new(request.task_id.clone(), instance_id))
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError> {
        let instance_id = handle.token();
        if self.instances().remove(instance_id).is_none() {
            return Err(CancelError::UnknownHandle(instance_id.to_string()));
        }
        self.backend.terminate_instance(instance_id).await?;
        debug!(task_id = %handle.task_id(), instance_id, "Terminated instance");
        Ok(())
    }
}

#[async_trait]
impl Prober for VmFleetAdapter {
    async fn probe(
        &self,
        handle: &ExecutionHandle,
        timeout: Duration,
    ) -> Result<Verdict, ProbeError> {
        let instance_id = handle.token();
        let results_key = self
            .instances()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ProbeError::UnknownHandle(instance_id.to_string()))?;

        let state = match self.wait_until_down(instance_id, timeout).await {
            Ok(state) => state,
            // The worker cancels timed-out executions itself.
            Err(e @ ProbeError::Timeout(_)) => return Err(e),
            Err(e) => {
                // Nothing will look at this instance again.
                self.instances().remove(instance_id);
                if let Err(terminate) = self.backend.terminate_instance(instance_id).await {
                    warn!(instance_id, error = %terminate, "Failed to terminate lost instance");
                }
                return Err(e);
            }
        };
        self.instances().remove(instance_id);

        if self.config.terminate_on_finish && state != InstanceState::Terminated {
            if let Err(e) = self.backend.terminate_instance(instance_id).await {
                warn!(instance_id, error = %e, "Failed to terminate finished instance");
            }
        }

        let Some(raw) = self.backend.fetch_object(&results_key).await? else {
            return Ok(Verdict::Failed(format!(
                "instance {} ({}) uploaded no results",
                instance_id, state
            )));
        };
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| ProbeError::Lost(format!("malformed {}: {}", results_key, e)))?;
        Ok(match passed_from_results(&value) {
            Some(true) => Verdict::Passed,
            Some(false) => Verdict::Failed("results.json reports the task unresolved".to_string()),
            None => Verdict::Failed(format!("{} carries no pass/fail field", results_key)),
        })
    }
}
