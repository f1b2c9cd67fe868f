//! Docker container adapter.
//!
//! Launch is `docker run -d`, probe polls `docker inspect` until the
//! container has exited, cancel is `docker rm -f`. The task passes when the
//! container exits with code 0.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use super::poll::{poll_until, PollPolicy};
use super::{
    render_template, sanitize_lowercase_name, ExecutionHandle, LaunchRequest, Launcher, Prober,
};
use crate::batch::Verdict;
use crate::error::{CancelError, LaunchError, ProbeError};

/// Configuration for [`ContainerAdapter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Program plus leading arguments used to reach the container
    /// runtime, e.g. `["docker"]` or `["sudo", "docker"]`.
    pub docker_command: Vec<String>,
    /// Image every task runs in.
    pub image: String,
    /// Command run inside the container. Same placeholders as the local
    /// adapter, minus `{output_dir}`.
    pub command: Vec<String>,
    /// Extra `docker run` arguments (`--cpus`, `--memory`, volumes).
    pub run_args: Vec<String>,
    /// Leave finished containers around for debugging.
    pub keep_containers: bool,
    pub poll: PollPolicy,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let command = [
            "tb",
            "run",
            "--dataset",
            "{dataset}",
            "--task-id",
            "{task_id}",
            "--agent",
            "{agent}",
            "--model",
            "{model}",
            "--output-path",
            "/results",
        ];
        Self {
            docker_command: vec!["docker".to_string()],
            image: "terminal-bench:latest".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            run_args: Vec::new(),
            keep_containers: false,
            poll: PollPolicy::default(),
        }
    }
}

impl ContainerConfig {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_docker_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.docker_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_keep_containers(mut self, keep: bool) -> Self {
        self.keep_containers = keep;
        self
    }
}

/// Runs each task in its own container.
pub struct ContainerAdapter {
    config: ContainerConfig,
}

impl ContainerAdapter {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    async fn docker(&self, args: &[String]) -> std::io::Result<Output> {
        let (program, prefix) = match self.config.docker_command.split_first() {
            Some((program, prefix)) => (program.as_str(), prefix),
            None => ("docker", &[][..]),
        };
        Command::new(program)
            .args(prefix)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<i32>, ProbeError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            container_id.to_string(),
        ];
        let output = self
            .docker(&args)
            .await
            .map_err(|e| ProbeError::Transport(format!("docker inspect: {}", e)))?;
        if !output.status.success() {
            return Err(ProbeError::Lost(format!(
                "docker inspect {}: {}",
                container_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    async fn remove(&self, container_id: &str) -> std::io::Result<Output> {
        let args = vec!["rm".to_string(), "-f".to_string(), container_id.to_string()];
        self.docker(&args).await
    }
}

#[async_trait]
impl Launcher for ContainerAdapter {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<ExecutionHandle, LaunchError> {
        let name = format!(
            "fleet-{}-{}",
            sanitize_lowercase_name(request.batch_id.as_str()),
            sanitize_lowercase_name(request.task_id.as_str())
        );

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.clone(),
        ];
        let mut env: Vec<(String, String)> = request
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("TASK_ID".to_string(), request.task_id.to_string()));
        env.push(("BATCH_ID".to_string(), request.batch_id.to_string()));
        env.push(("MODEL".to_string(), request.config.model.clone()));
        env.push(("AGENT".to_string(), request.config.agent.clone()));
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend(self.config.run_args.iter().cloned());
        args.push(self.config.image.clone());
        args.extend(render_template(&self.config.command, &request.template_vars()));

        let output = self
            .docker(&args)
            .await
            .map_err(|e| LaunchError::Spawn(format!("docker run: {}", e)))?;
        if !output.status.success() {
            return Err(LaunchError::Rejected(format!(
                "docker run exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(LaunchError::Rejected(
                "docker run returned no container id".to_string(),
            ));
        }
        debug!(task_id = %request.task_id, container = %name, id = %container_id, "Started container");
        Ok(ExecutionHandle::new(request.task_id.clone(), container_id))
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError> {
        let output = self.remove(handle.token()).await?;
        if !output.status.success() {
            return Err(CancelError::Failed(format!(
                "docker rm -f {}: {}",
                handle.token(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(task_id = %handle.task_id(), id = handle.token(), "Removed container");
        Ok(())
    }
}

#[async_trait]
impl Prober for ContainerAdapter {
    async fn probe(
        &self,
        handle: &ExecutionHandle,
        timeout: Duration,
    ) -> Result<Verdict, ProbeError> {
        let container_id = handle.token();
        let exit_code =
            poll_until(&self.config.poll, timeout, || self.inspect(container_id)).await?;

        if !self.config.keep_containers {
            match self.remove(container_id).await {
                Ok(output) if output.status.success() => {}
                Ok(output) => warn!(
                    id = container_id,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Failed to remove finished container"
                ),
                Err(e) => warn!(id = container_id, error = %e, "Failed to remove finished container"),
            }
        }

        Ok(match exit_code {
            0 => Verdict::Passed,
            code => Verdict::Failed(format!("container exited with code {}", code)),
        })
    }
}

/// Parses `<status> <exit code>` from `docker inspect`. `None` while the
/// container can still make progress.
fn parse_inspect(stdout: &str) -> Result<Option<i32>, ProbeError> {
    let mut parts = stdout.split_whitespace();
    let status = parts
        .next()
        .ok_or_else(|| ProbeError::Lost("empty docker inspect output".to_string()))?;
    match status {
        "created" | "running" | "restarting" | "paused" | "removing" => Ok(None),
        "exited" | "dead" => {
            let code = parts
                .next()
                .and_then(|c| c.parse::<i32>().ok())
                .ok_or_else(|| {
                    ProbeError::Lost(format!("unparseable docker inspect output: {}", stdout.trim()))
                })?;
            Ok(Some(code))
        }
        other => Err(ProbeError::Lost(format!("unknown container state '{}'", other))),
    }
}
