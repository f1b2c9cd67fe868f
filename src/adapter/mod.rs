//! Launcher and prober adapters for task execution backends.
//!
//! Each adapter knows how to:
//! 1. Start one task execution and hand back an opaque handle
//! 2. Wait (bounded) for that execution to reach a terminal state
//! 3. Best-effort cancel an execution that is no longer wanted
//!
//! The scheduler only ever talks to the [`Launcher`] and [`Prober`] traits,
//! so backends are interchangeable. Most adapters implement both traits on
//! one struct; [`AdapterPair::from_adapter`] splits such a struct into the
//! two trait objects the scheduler takes.

pub mod container;
#[cfg(feature = "ec2")]
pub mod ec2;
pub mod local;
pub mod poll;
pub mod remote;
pub mod scripted;
pub mod vm;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::batch::{BatchId, TaskId, Verdict};
use crate::error::{CancelError, ConfigError, LaunchError, ProbeError};

pub use container::{ContainerAdapter, ContainerConfig};
pub use local::{LocalProcessAdapter, LocalProcessConfig};
pub use poll::{deadline_after, poll_until, PollPolicy};
pub use remote::{
    CallState, CallStatus, RemoteFunctionAdapter, RemoteFunctionConfig, SpawnRequest, SpawnResponse,
};
pub use scripted::{Script, ScriptStats, ScriptedAdapter};
pub use vm::{InstanceBackend, InstanceRequest, InstanceState, VmFleetAdapter, VmFleetConfig};
#[cfg(feature = "ec2")]
pub use ec2::Ec2Backend;

/// Opaque reference to one running execution.
///
/// Only the adapter that issued a handle can interpret its token. A handle
/// is used at most once for probe and at most once for cancel.
#[derive(Debug, PartialEq, Eq)]
pub struct ExecutionHandle {
    task_id: TaskId,
    token: String,
}

impl ExecutionHandle {
    pub fn new(task_id: TaskId, token: impl Into<String>) -> Self {
        Self {
            task_id,
            token: token.into(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Adapter-specific reference (process key, container id, call id).
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Parameters forwarded to every launch in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Model identifier passed to the agent.
    pub model: String,
    /// Agent implementation to run.
    pub agent: String,
    /// Dataset the task ids belong to.
    pub dataset: String,
    /// Extra environment for the execution.
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            agent: "opencode".to_string(),
            dataset: "terminal-bench-core".to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl LaunchConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Everything a launcher needs to start one task.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub batch_id: &'a BatchId,
    pub task_id: &'a TaskId,
    pub config: &'a LaunchConfig,
}

impl LaunchRequest<'_> {
    /// Placeholder values for command templates.
    pub(crate) fn template_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("batch_id", self.batch_id.to_string()),
            ("task_id", self.task_id.to_string()),
            ("model", self.config.model.clone()),
            ("agent", self.config.agent.clone()),
            ("dataset", self.config.dataset.clone()),
        ]
    }
}

/// Starts task executions.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Starts one execution. Returns as soon as the backend has accepted it.
    async fn launch(&self, request: LaunchRequest<'_>) -> Result<ExecutionHandle, LaunchError>;

    /// Best-effort request to stop an execution. Idempotent from the
    /// caller's point of view.
    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError>;
}

/// Observes task executions until they finish.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Waits until the execution is terminal and classifies it.
    ///
    /// Must return `ProbeError::Timeout` rather than exceed `timeout`.
    async fn probe(&self, handle: &ExecutionHandle, timeout: Duration)
        -> Result<Verdict, ProbeError>;
}

/// A launcher and prober backed by the same adapter.
#[derive(Clone)]
pub struct AdapterPair {
    pub launcher: Arc<dyn Launcher>,
    pub prober: Arc<dyn Prober>,
}

impl AdapterPair {
    pub fn from_adapter<A>(adapter: A) -> Self
    where
        A: Launcher + Prober + 'static,
    {
        Self::from_arc(Arc::new(adapter))
    }

    pub fn from_arc<A>(adapter: Arc<A>) -> Self
    where
        A: Launcher + Prober + 'static,
    {
        Self {
            launcher: adapter.clone(),
            prober: adapter,
        }
    }
}

impl fmt::Debug for AdapterPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterPair")
            .field("backend", &self.launcher.name())
            .finish()
    }
}

/// Supported execution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Subprocess on this machine.
    #[default]
    Local,
    /// Docker container.
    Container,
    /// Remote function service over HTTP.
    Remote,
    /// One virtual machine per task.
    VmFleet,
    /// Deterministic in-process adapter; every task passes.
    Scripted,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterKind::Local => "local",
            AdapterKind::Container => "container",
            AdapterKind::Remote => "remote",
            AdapterKind::VmFleet => "vm_fleet",
            AdapterKind::Scripted => "scripted",
        };
        f.write_str(name)
    }
}

impl FromStr for AdapterKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "process" => Ok(AdapterKind::Local),
            "container" | "docker" => Ok(AdapterKind::Container),
            "remote" | "function" => Ok(AdapterKind::Remote),
            "vm_fleet" | "vm-fleet" | "vm" | "ec2" => Ok(AdapterKind::VmFleet),
            "scripted" | "dry-run" | "dry_run" => Ok(AdapterKind::Scripted),
            other => Err(ConfigError::UnknownAdapter(other.to_string())),
        }
    }
}

/// Backend selection plus per-backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    pub local: LocalProcessConfig,
    pub container: ContainerConfig,
    pub remote: RemoteFunctionConfig,
    pub vm_fleet: VmFleetConfig,
}

impl AdapterConfig {
    /// Builds the selected adapter.
    pub fn build(&self) -> Result<AdapterPair, ConfigError> {
        let pair = match self.kind {
            AdapterKind::Local => {
                AdapterPair::from_adapter(LocalProcessAdapter::new(self.local.clone()))
            }
            AdapterKind::Container => {
                AdapterPair::from_adapter(ContainerAdapter::new(self.container.clone()))
            }
            AdapterKind::Remote => {
                AdapterPair::from_adapter(RemoteFunctionAdapter::new(self.remote.clone())?)
            }
            AdapterKind::VmFleet => vm_fleet_pair(&self.vm_fleet)?,
            AdapterKind::Scripted => AdapterPair::from_adapter(ScriptedAdapter::new(Script::pass())),
        };
        tracing::debug!(backend = pair.launcher.name(), "Built execution adapter");
        Ok(pair)
    }
}

#[cfg(feature = "ec2")]
fn vm_fleet_pair(config: &VmFleetConfig) -> Result<AdapterPair, ConfigError> {
    let backend = Arc::new(Ec2Backend::new(config.clone()));
    Ok(AdapterPair::from_adapter(VmFleetAdapter::new(
        config.clone(),
        backend,
    )?))
}

#[cfg(not(feature = "ec2"))]
fn vm_fleet_pair(config: &VmFleetConfig) -> Result<AdapterPair, ConfigError> {
    config.validate()?;
    Err(ConfigError::InvalidValue {
        key: "adapter.kind".to_string(),
        message: "vm_fleet needs bench-fleet built with the `ec2` feature".to_string(),
    })
}

/// Replaces `{name}` placeholders in each template argument.
pub(crate) fn render_template(template: &[String], vars: &[(&str, String)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

/// Makes an id safe for use in file and container names.
///
/// Ids that are already safe come back unchanged. Anything rewritten gets a
/// short digest of the original appended, so `a/b` and `a_b` stay distinct.
pub(crate) fn sanitize_name(raw: &str) -> String {
    let safe: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe == raw && !raw.starts_with('.') {
        safe
    } else {
        format!("{}-{}", safe.trim_start_matches('.'), short_digest(raw))
    }
}

/// Like [`sanitize_name`], but lowercase. Mixed-case ids get a digest so
/// `Task` and `task` do not collide.
pub(crate) fn sanitize_lowercase_name(raw: &str) -> String {
    let safe = sanitize_name(raw);
    if safe.bytes().any(|b| b.is_ascii_uppercase()) {
        format!("{}-{}", safe.to_ascii_lowercase(), short_digest(raw))
    } else {
        safe
    }
}

fn short_digest(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_from_str() {
        assert_eq!("local".parse::<AdapterKind>().unwrap(), AdapterKind::Local);
        assert_eq!("Docker".parse::<AdapterKind>().unwrap(), AdapterKind::Container);
        assert_eq!("remote".parse::<AdapterKind>().unwrap(), AdapterKind::Remote);
        assert_eq!("dry-run".parse::<AdapterKind>().unwrap(), AdapterKind::Scripted);
        assert_eq!("ec2".parse::<AdapterKind>().unwrap(), AdapterKind::VmFleet);
        assert_eq!(AdapterKind::VmFleet.to_string(), "vm_fleet");
        assert!(matches!(
            "lambda".parse::<AdapterKind>(),
            Err(ConfigError::UnknownAdapter(_))
        ));
    }

    #[test]
    fn test_render_template() {
        let template = vec![
            "tb".to_string(),
            "--task-id".to_string(),
            "{task_id}".to_string(),
            "--output-path={output_dir}/{task_id}".to_string(),
        ];
        let vars = vec![
            ("task_id", "hello-world".to_string()),
            ("output_dir", "/tmp/out".to_string()),
        ];
        let rendered = render_template(&template, &vars);
        assert_eq!(
            rendered,
            vec!["tb", "--task-id", "hello-world", "--output-path=/tmp/out/hello-world"]
        );
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("hello-world.v2"), "hello-world.v2");
        assert_eq!(sanitize_name("a_b"), "a_b");

        let rewritten = sanitize_name("fix git/merge conflict");
        assert!(rewritten.starts_with("fix_git_merge_conflict-"));
        assert_eq!(rewritten.len(), "fix_git_merge_conflict-".len() + 8);
        assert_eq!(rewritten, sanitize_name("fix git/merge conflict"));
    }

    #[test]
    fn test_sanitized_names_do_not_collide() {
        assert_ne!(sanitize_name("a/b"), sanitize_name("a_b"));
        assert_ne!(sanitize_name("a/b"), sanitize_name("a b"));
        assert!(!sanitize_name("..").starts_with('.'));
        assert!(!sanitize_name("..").contains('/'));

        assert_eq!(sanitize_lowercase_name("hello-world"), "hello-world");
        assert_ne!(sanitize_lowercase_name("Task"), sanitize_lowercase_name("task"));
        assert!(sanitize_lowercase_name("Task")
            .bytes()
            .all(|b| !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_launch_config_defaults_and_builders() {
        let config = LaunchConfig::default()
            .with_model("anthropic/claude-sonnet")
            .with_env("TB_DEBUG", "1");
        assert_eq!(config.model, "anthropic/claude-sonnet");
        assert_eq!(config.dataset, "terminal-bench-core");
        assert_eq!(config.env.get("TB_DEBUG").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_build_scripted_adapter() {
        let config = AdapterConfig {
            kind: AdapterKind::Scripted,
            ..Default::default()
        };
        let pair = config.build().unwrap();
        assert_eq!(pair.launcher.name(), "scripted");
    }
}
