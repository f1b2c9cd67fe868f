//! Local subprocess adapter.
//!
//! Runs the task runner command on this machine, one process per task. The
//! process writes into a per-task output directory
//! (`<output_root>/<batch_id>/<task_id>/`) which also receives the captured
//! `stdout.log` and `stderr.log`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{render_template, sanitize_name, ExecutionHandle, LaunchRequest, Launcher, Prober};
use crate::batch::Verdict;
use crate::error::{CancelError, LaunchError, ProbeError};

/// Name of the results file the task runner writes.
const RESULTS_FILE: &str = "results.json";

/// Configuration for [`LocalProcessAdapter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProcessConfig {
    /// Command template. Supports `{task_id}`, `{batch_id}`, `{model}`,
    /// `{agent}`, `{dataset}` and `{output_dir}`.
    pub command: Vec<String>,
    /// Root directory for per-task output.
    pub output_root: PathBuf,
    /// Working directory for the runner; inherits ours when unset.
    pub working_dir: Option<PathBuf>,
}

impl Default for LocalProcessConfig {
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
            "{output_dir}",
        ];
        Self {
            command: command.iter().map(|s| s.to_string()).collect(),
            output_root: PathBuf::from("./fleet-runs"),
            working_dir: None,
        }
    }
}

impl LocalProcessConfig {
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }
}

struct ProcessSlot {
    exit_rx: Option<oneshot::Receiver<io::Result<ExitStatus>>>,
    kill_tx: Option<oneshot::Sender<()>>,
    output_dir: PathBuf,
}

/// Runs tasks as local subprocesses.
pub struct LocalProcessAdapter {
    config: LocalProcessConfig,
    processes: Mutex<HashMap<String, ProcessSlot>>,
}

impl LocalProcessAdapter {
    pub fn new(config: LocalProcessConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of launched processes that have been neither probed to
    /// completion nor cancelled.
    pub fn tracked(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, ProcessSlot>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_slot(&self, token: &str) -> Option<ProcessSlot> {
        self.slots().remove(token)
    }
}

#[async_trait]
impl Launcher for LocalProcessAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<ExecutionHandle, LaunchError> {
        let output_dir = self
            .config
            .output_root
            .join(sanitize_name(request.batch_id.as_str()))
            .join(sanitize_name(request.task_id.as_str()));
        tokio::fs::create_dir_all(&output_dir).await?;

        let mut vars = request.template_vars();
        vars.push(("output_dir", output_dir.display().to_string()));
        let argv = render_template(&self.config.command, &vars);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| LaunchError::Spawn("empty command template".to_string()))?;

        let stdout = std::fs::File::create(output_dir.join("stdout.log"))?;
        let stderr = std::fs::File::create(output_dir.join("stderr.log"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&request.config.env)
            .env("TASK_ID", request.task_id.as_str())
            .env("BATCH_ID", request.batch_id.as_str())
            .env("MODEL", &request.config.model)
            .env("AGENT", &request.config.agent)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::Spawn(format!("{}: {}", program, e)))?;
        let pid = child.id();

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            // A dropped kill sender also stops the process: the adapter no
            // longer tracks it.
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.kill().await {
                        warn!(pid = ?pid, error = %e, "Failed to kill task runner");
                    }
                    child.wait().await
                }
            };
            let _ = exit_tx.send(status);
        });

        let token = format!("{}/{}", request.batch_id, request.task_id);
        debug!(
            task_id = %request.task_id,
            pid = ?pid,
            output_dir = %output_dir.display(),
            "Spawned task runner"
        );
        self.slots().insert(
            token.clone(),
            ProcessSlot {
                exit_rx: Some(exit_rx),
                kill_tx: Some(kill_tx),
                output_dir,
            },
        );

        Ok(ExecutionHandle::new(request.task_id.clone(), token))
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError> {
        let mut slot = self
            .remove_slot(handle.token())
            .ok_or_else(|| CancelError::UnknownHandle(handle.token().to_string()))?;
        if let Some(kill_tx) = slot.kill_tx.take() {
            // The receiver is gone once the process has exited on its own.
            let _ = kill_tx.send(());
        }
        debug!(task_id = %handle.task_id(), "Cancelled task runner");
        Ok(())
    }
}

#[async_trait]
impl Prober for LocalProcessAdapter {
    async fn probe(
        &self,
        handle: &ExecutionHandle,
        timeout: Duration,
    ) -> Result<Verdict, ProbeError> {
        let (exit_rx, output_dir) = {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(handle.token())
                .ok_or_else(|| ProbeError::UnknownHandle(handle.token().to_string()))?;
            let exit_rx = slot
                .exit_rx
                .take()
                .ok_or_else(|| ProbeError::Lost("execution is already being probed".to_string()))?;
            (exit_rx, slot.output_dir.clone())
        };

        // On timeout the slot stays registered so cancel can kill it.
        let status = match tokio::time::timeout(timeout, exit_rx).await {
            Err(_) => return Err(ProbeError::Timeout(timeout)),
            Ok(Err(_)) => {
                self.remove_slot(handle.token());
                return Err(ProbeError::Lost("task runner exited without a status".to_string()));
            }
            Ok(Ok(status)) => {
                self.remove_slot(handle.token());
                status?
            }
        };

        Ok(classify(&output_dir, status).await)
    }
}

async fn classify(output_dir: &Path, status: ExitStatus) -> Verdict {
    if let Some(passed) = read_results(output_dir).await {
        return if passed {
            Verdict::Passed
        } else {
            Verdict::Failed("results.json reports the task unresolved".to_string())
        };
    }

    match status.code() {
        Some(0) => Verdict::Passed,
        Some(code) => Verdict::Failed(format!("exit code {}", code)),
        None => Verdict::Failed("terminated by signal".to_string()),
    }
}

/// Looks for a results file at the top of `output_dir`, then one level down
/// (the runner nests its output under a run directory).
async fn read_results(output_dir: &Path) -> Option<bool> {
    if let Some(passed) = read_results_file(&output_dir.join(RESULTS_FILE)).await {
        return Some(passed);
    }

    let mut entries = tokio::fs::read_dir(output_dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_dir() {
            if let Some(passed) = read_results_file(&path.join(RESULTS_FILE)).await {
                return Some(passed);
            }
        }
    }
    None
}

async fn read_results_file(path: &Path) -> Option<bool> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed results file");
            return None;
        }
    };
    passed_from_results(&value)
}

/// Pass/fail from a `results.json` document, if it carries one.
pub(crate) fn passed_from_results(value: &serde_json::Value) -> Option<bool> {
    if let Some(passed) = value.get("passed").and_then(|v| v.as_bool()) {
        return Some(passed);
    }
    if let Some(resolved) = value.get("is_resolved").and_then(|v| v.as_bool()) {
        return Some(resolved);
    }
    if let Some(n) = value.get("n_resolved").and_then(|v| v.as_u64()) {
        return Some(n > 0);
    }
    value
        .get("results")
        .and_then(|v| v.as_array())
        .and_then(|results| results.first())
        .and_then(|first| first.get("is_resolved"))
        .and_then(|v| v.as_bool())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::adapter::LaunchConfig;
    use crate::batch::{BatchId, TaskId};

    fn adapter(root: &Path, script: &str) -> LocalProcessAdapter {
        LocalProcessAdapter::new(
            LocalProcessConfig::default()
                .with_command(["sh", "-c", script])
                .with_output_root(root),
        )
    }

    async fn launch(adapter: &LocalProcessAdapter, task: &str) -> ExecutionHandle {
        let batch = BatchId::from("batch-local");
        let task = TaskId::from(task);
        let config = LaunchConfig::default();
        adapter
            .launch(LaunchRequest {
                batch_id: &batch,
                task_id: &task,
                config: &config,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_zero_exit_passes() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), "echo running {task_id}");
        let handle = launch(&adapter, "hello-world").await;

        let verdict = adapter.probe(&handle, Duration::from_secs(10)).await.unwrap();
        assert_eq!(verdict, Verdict::Passed);
        assert_eq!(adapter.tracked(), 0);

        let stdout = std::fs::read_to_string(
            dir.path().join("batch-local").join("hello-world").join("stdout.log"),
        )
        .unwrap();
        assert_eq!(stdout.trim(), "running hello-world");
    }

    #[tokio::test]
    async fn test_lookalike_task_ids_get_separate_output_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), "echo {task_id}");
        let slashed = launch(&adapter, "a/b").await;
        let underscored = launch(&adapter, "a_b").await;
        adapter.probe(&slashed, Duration::from_secs(10)).await.unwrap();
        adapter.probe(&underscored, Duration::from_secs(10)).await.unwrap();

        let batch_dir = dir.path().join("batch-local");
        let mut outputs: Vec<String> = std::fs::read_dir(&batch_dir)
            .unwrap()
            .map(|entry| {
                std::fs::read_to_string(entry.unwrap().path().join("stdout.log"))
                    .unwrap()
                    .trim()
                    .to_string()
            })
            .collect();
        outputs.sort();
        assert_eq!(outputs, vec!["a/b", "a_b"]);
        assert!(batch_dir.join("a_b").is_dir());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), "exit 3");
        let handle = launch(&adapter, "broken").await;

        let verdict = adapter.probe(&handle, Duration::from_secs(10)).await.unwrap();
        assert_eq!(verdict, Verdict::Failed("exit code 3".into()));
    }

    #[tokio::test]
    async fn test_results_file_overrides_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(
            dir.path(),
            r#"mkdir -p {output_dir}/run && echo '{"is_resolved": false}' > {output_dir}/run/results.json"#,
        );
        let handle = launch(&adapter, "unresolved").await;

        let verdict = adapter.probe(&handle, Duration::from_secs(10)).await.unwrap();
        assert!(matches!(verdict, Verdict::Failed(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalProcessAdapter::new(
            LocalProcessConfig::default()
                .with_command(["definitely-not-a-real-binary-7f3a"])
                .with_output_root(dir.path()),
        );
        let batch = BatchId::from("batch-local");
        let task = TaskId::from("a");
        let config = LaunchConfig::default();
        let err = adapter
            .launch(LaunchRequest {
                batch_id: &batch,
                task_id: &task,
                config: &config,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_probe_timeout_then_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path(), "sleep 30");
        let handle = launch(&adapter, "slow").await;

        let err = adapter
            .probe(&handle, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
        assert_eq!(adapter.tracked(), 1);

        adapter.cancel(&handle).await.unwrap();
        assert_eq!(adapter.tracked(), 0);
        assert!(matches!(
            adapter.cancel(&handle).await,
            Err(CancelError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_passed_from_results_variants() {
        let v = serde_json::json!({"passed": true});
        assert_eq!(passed_from_results(&v), Some(true));
        let v = serde_json::json!({"n_resolved": 0, "n_unresolved": 1});
        assert_eq!(passed_from_results(&v), Some(false));
        let v = serde_json::json!({"results": [{"task_id": "a", "is_resolved": true}]});
        assert_eq!(passed_from_results(&v), Some(true));
        let v = serde_json::json!({"accuracy": 1.0});
        assert_eq!(passed_from_results(&v), None);
    }
}
