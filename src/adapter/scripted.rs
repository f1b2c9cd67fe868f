//! Deterministic in-process adapter.
//!
//! Used by the test suites and by `--adapter scripted` dry runs. Behaviour
//! is scripted per task, and every call is counted so tests can assert on
//! launch, probe and cancel traffic as well as on peak concurrency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ExecutionHandle, LaunchRequest, Launcher, Prober};
use crate::batch::{TaskId, Verdict};
use crate::error::{CancelError, LaunchError, ProbeError};

/// What the adapter does for one task.
#[derive(Debug, Clone)]
pub enum Script {
    /// Probe reports `Passed` after `delay`.
    Pass { delay: Duration },
    /// Probe reports `Failed(reason)` after `delay`.
    Fail { delay: Duration, reason: String },
    /// Launch fails with this message.
    LaunchError(String),
    /// Probe fails with `ProbeError::Lost` after `delay`.
    ProbeError { delay: Duration, error: String },
    /// Probe never returns and ignores its own timeout.
    Hang,
    /// Launch never returns.
    HangLaunch,
    /// Probe panics.
    PanicOnProbe,
}

impl Script {
    pub fn pass() -> Self {
        Script::Pass {
            delay: Duration::ZERO,
        }
    }

    pub fn pass_after(delay: Duration) -> Self {
        Script::Pass { delay }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Script::Fail {
            delay: Duration::ZERO,
            reason: reason.into(),
        }
    }

    pub fn launch_error(message: impl Into<String>) -> Self {
        Script::LaunchError(message.into())
    }

    pub fn probe_error(message: impl Into<String>) -> Self {
        Script::ProbeError {
            delay: Duration::ZERO,
            error: message.into(),
        }
    }
}

/// Call counters shared with the test that owns the adapter.
#[derive(Debug, Default)]
pub struct ScriptStats {
    launches: AtomicUsize,
    probes: AtomicUsize,
    cancels: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    probed: Mutex<Vec<TaskId>>,
    cancelled: Mutex<Vec<TaskId>>,
}

impl ScriptStats {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Executions between launch start and probe end (or cancel) right now.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest value `active` ever reached.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn probed_tasks(&self) -> Vec<TaskId> {
        self.probed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cancelled_tasks(&self) -> Vec<TaskId> {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            stats: Arc::clone(self),
        }
    }
}

/// Decrements the active count when dropped.
struct ActiveGuard {
    stats: Arc<ScriptStats>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Releases a launched execution's guard when the probe ends or its future
/// is dropped.
struct ProbeRelease<'a> {
    adapter: &'a ScriptedAdapter,
    token: &'a str,
}

impl Drop for ProbeRelease<'_> {
    fn drop(&mut self) {
        self.adapter.release(self.token);
    }
}

/// Adapter whose behaviour is fixed up front.
pub struct ScriptedAdapter {
    default: Script,
    scripts: HashMap<TaskId, Script>,
    launch_delay: Duration,
    fail_cancel: bool,
    stats: Arc<ScriptStats>,
    /// Guards of launched executions, keyed by token. An execution leaves
    /// the active count when its probe ends or when it is cancelled,
    /// whichever comes first.
    open: Mutex<HashMap<String, ActiveGuard>>,
}

impl ScriptedAdapter {
    /// Every task without its own script follows `default`.
    pub fn new(default: Script) -> Self {
        Self {
            default,
            scripts: HashMap::new(),
            launch_delay: Duration::ZERO,
            fail_cancel: false,
            stats: Arc::new(ScriptStats::default()),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_script(mut self, task_id: impl Into<TaskId>, script: Script) -> Self {
        self.scripts.insert(task_id.into(), script);
        self
    }

    /// Every launch sleeps this long before returning.
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Every cancel request fails.
    pub fn with_failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    pub fn stats(&self) -> Arc<ScriptStats> {
        Arc::clone(&self.stats)
    }

    fn script_for(&self, task_id: &TaskId) -> &Script {
        self.scripts.get(task_id).unwrap_or(&self.default)
    }

    fn release(&self, token: &str) {
        let guard = self
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
        drop(guard);
    }
}

#[async_trait]
impl Launcher for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<ExecutionHandle, LaunchError> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        let guard = self.stats.enter();

        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }

        match self.script_for(request.task_id) {
            Script::LaunchError(message) => Err(LaunchError::Rejected(message.clone())),
            Script::HangLaunch => futures::future::pending().await,
            _ => {
                let handle = ExecutionHandle::new(
                    request.task_id.clone(),
                    format!("{}/{}", request.batch_id, request.task_id),
                );
                self.open
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(handle.token().to_string(), guard);
                Ok(handle)
            }
        }
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError> {
        self.stats.cancels.fetch_add(1, Ordering::SeqCst);
        self.stats
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.task_id().clone());
        self.release(handle.token());

        if self.fail_cancel {
            return Err(CancelError::Failed(format!(
                "scripted cancel failure for {}",
                handle.token()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Prober for ScriptedAdapter {
    async fn probe(
        &self,
        handle: &ExecutionHandle,
        _timeout: Duration,
    ) -> Result<Verdict, ProbeError> {
        self.stats.probes.fetch_add(1, Ordering::SeqCst);
        self.stats
            .probed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.task_id().clone());

        let _release = ProbeRelease {
            adapter: self,
            token: handle.token(),
        };

        match self.script_for(handle.task_id()).clone() {
            Script::Pass { delay } => {
                tokio::time::sleep(delay).await;
                Ok(Verdict::Passed)
            }
            Script::Fail { delay, reason } => {
                tokio::time::sleep(delay).await;
                Ok(Verdict::Failed(reason))
            }
            Script::ProbeError { delay, error } => {
                tokio::time::sleep(delay).await;
                Err(ProbeError::Lost(error))
            }
            Script::Hang => futures::future::pending().await,
            Script::PanicOnProbe => panic!("scripted probe panic for {}", handle.task_id()),
            Script::LaunchError(_) | Script::HangLaunch => Err(ProbeError::UnknownHandle(
                handle.token().to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LaunchConfig;
    use crate::batch::BatchId;

    fn request<'a>(
        batch_id: &'a BatchId,
        task_id: &'a TaskId,
        config: &'a LaunchConfig,
    ) -> LaunchRequest<'a> {
        LaunchRequest {
            batch_id,
            task_id,
            config,
        }
    }

    #[tokio::test]
    async fn test_scripted_pass_and_fail() {
        let adapter =
            ScriptedAdapter::new(Script::pass()).with_script("b", Script::fail("tests failed"));
        let batch = BatchId::from("batch-s");
        let config = LaunchConfig::default();

        let a = TaskId::from("a");
        let handle = adapter.launch(request(&batch, &a, &config)).await.unwrap();
        assert_eq!(handle.token(), "batch-s/a");
        assert_eq!(
            adapter.probe(&handle, Duration::from_secs(1)).await.unwrap(),
            Verdict::Passed
        );

        let b = TaskId::from("b");
        let handle = adapter.launch(request(&batch, &b, &config)).await.unwrap();
        assert_eq!(
            adapter.probe(&handle, Duration::from_secs(1)).await.unwrap(),
            Verdict::Failed("tests failed".into())
        );

        let stats = adapter.stats();
        assert_eq!(stats.launches(), 2);
        assert_eq!(stats.probes(), 2);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.peak(), 1);
    }

    #[tokio::test]
    async fn test_scripted_launch_error_releases_active_slot() {
        let adapter = ScriptedAdapter::new(Script::launch_error("no capacity"));
        let batch = BatchId::from("batch-s");
        let config = LaunchConfig::default();
        let task = TaskId::from("a");

        let err = adapter
            .launch(request(&batch, &task, &config))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Rejected(ref m) if m == "no capacity"));
        assert_eq!(adapter.stats().active(), 0);
    }

    #[tokio::test]
    async fn test_scripted_hang_counts_as_active_until_dropped() {
        let adapter = ScriptedAdapter::new(Script::Hang);
        let batch = BatchId::from("batch-s");
        let config = LaunchConfig::default();
        let task = TaskId::from("a");

        let handle = adapter.launch(request(&batch, &task, &config)).await.unwrap();
        let stats = adapter.stats();
        assert_eq!(stats.active(), 1);

        let probe = tokio::time::timeout(
            Duration::from_millis(20),
            adapter.probe(&handle, Duration::from_millis(20)),
        )
        .await;
        assert!(probe.is_err());
        assert_eq!(stats.active(), 0);
    }

    #[tokio::test]
    async fn test_cancel_right_after_launch_releases_active_slot() {
        let adapter = ScriptedAdapter::new(Script::Hang);
        let batch = BatchId::from("batch-s");
        let config = LaunchConfig::default();
        let task = TaskId::from("a");

        let handle = adapter.launch(request(&batch, &task, &config)).await.unwrap();
        let stats = adapter.stats();
        assert_eq!(stats.active(), 1);

        adapter.cancel(&handle).await.unwrap();
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.probes(), 0);

        // A late probe does not release the slot twice.
        let _ = tokio::time::timeout(
            Duration::from_millis(10),
            adapter.probe(&handle, Duration::from_millis(10)),
        )
        .await;
        assert_eq!(stats.active(), 0);
    }

    #[tokio::test]
    async fn test_scripted_cancel_is_recorded() {
        let adapter = ScriptedAdapter::new(Script::pass()).with_failing_cancel();
        let handle = ExecutionHandle::new(TaskId::from("x"), "batch/x");
        assert!(adapter.cancel(&handle).await.is_err());
        let stats = adapter.stats();
        assert_eq!(stats.cancels(), 1);
        assert_eq!(stats.cancelled_tasks(), vec![TaskId::from("x")]);
    }
}
