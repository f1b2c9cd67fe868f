//! Bounded polling for adapters whose backend only offers a status query.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ProbeError;

/// Backoff schedule for status polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// Transport errors tolerated in a row before the probe gives up.
    pub max_consecutive_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 10_000,
            multiplier: 1.5,
            max_consecutive_errors: 5,
        }
    }
}

impl PollPolicy {
    /// Fixed interval, no growth. Handy in tests.
    pub fn fixed(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            initial_interval_ms: ms,
            max_interval_ms: ms,
            multiplier: 1.0,
            ..Default::default()
        }
    }

    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms.max(1))
    }

    fn next(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.multiplier.max(1.0);
        let cap = Duration::from_millis(self.max_interval_ms.max(self.initial_interval_ms).max(1));
        Duration::from_secs_f64(grown).min(cap)
    }
}

/// `start + timeout`, clamped to roughly thirty years out when the sum
/// does not fit in an `Instant`.
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Calls `step` until it yields a value, the step fails, or `timeout`
/// elapses.
///
/// `step` returns `Ok(None)` while the execution is still running. A
/// `ProbeError::Transport` is retried up to the policy's error budget; any
/// other error is returned at once. The timeout is a hard ceiling: an
/// in-flight step is dropped when it expires.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    timeout: Duration,
    mut step: F,
) -> Result<T, ProbeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ProbeError>>,
{
    let deadline = deadline_after(Instant::now(), timeout);
    let mut interval = policy.initial();
    let mut consecutive_errors = 0u32;

    loop {
        match tokio::time::timeout_at(deadline, step()).await {
            Err(_) => return Err(ProbeError::Timeout(timeout)),
            Ok(Ok(Some(value))) => return Ok(value),
            Ok(Ok(None)) => consecutive_errors = 0,
            Ok(Err(ProbeError::Transport(msg))) => {
                consecutive_errors += 1;
                if consecutive_errors > policy.max_consecutive_errors {
                    return Err(ProbeError::Transport(msg));
                }
                tracing::debug!(
                    attempt = consecutive_errors,
                    error = %msg,
                    "Status poll failed, retrying"
                );
            }
            Ok(Err(e)) => return Err(e),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        tokio::time::sleep(interval.min(remaining)).await;
        interval = policy.next(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let policy = PollPolicy {
            initial_interval_ms: 100,
            max_interval_ms: 250,
            multiplier: 2.0,
            max_consecutive_errors: 0,
        };
        let first = policy.initial();
        let second = policy.next(first);
        let third = policy.next(second);
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(250));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
        let far = deadline_after(now, Duration::from_secs(u64::MAX));
        assert!(far > now + Duration::from_secs(86_400 * 365));
    }

    #[tokio::test]
    async fn test_poll_until_huge_timeout_still_polls() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::fixed(Duration::from_millis(1));
        let result = poll_until(&policy, Duration::from_secs(u64::MAX), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n >= 1 { Some(n) } else { None }) }
        })
        .await
        .unwrap();
        assert_eq!(result, 1);
    }

    #[tokio::test]
    async fn test_poll_until_returns_value() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::fixed(Duration::from_millis(5));
        let result = poll_until(&policy, Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n >= 2 { Some(n) } else { None }) }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let policy = PollPolicy::fixed(Duration::from_millis(10));
        let started = std::time::Instant::now();
        let result: Result<(), _> =
            poll_until(&policy, Duration::from_millis(50), || async { Ok(None) }).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_poll_until_drops_slow_step() {
        let policy = PollPolicy::fixed(Duration::from_millis(10));
        let result: Result<(), _> = poll_until(&policy, Duration::from_millis(50), || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        })
        .await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried_within_budget() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::fixed(Duration::from_millis(1)).with_max_consecutive_errors(2);
        let result = poll_until(&policy, Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProbeError::Transport("connection reset".into()))
                } else {
                    Ok(Some("done"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn test_transport_errors_exhaust_budget() {
        let policy = PollPolicy::fixed(Duration::from_millis(1)).with_max_consecutive_errors(1);
        let result: Result<(), _> = poll_until(&policy, Duration::from_secs(1), || async {
            Err(ProbeError::Transport("refused".into()))
        })
        .await;
        assert!(matches!(result, Err(ProbeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_other_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::fixed(Duration::from_millis(1));
        let result: Result<(), _> = poll_until(&policy, Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProbeError::Lost("gone".into())) }
        })
        .await;
        assert!(matches!(result, Err(ProbeError::Lost(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
