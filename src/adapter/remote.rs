//! Remote function adapter.
//!
//! Talks to a function-call service over HTTP. Each task becomes one
//! remote call:
//!
//! - `POST {base}/spawn` with a [`SpawnRequest`] returns a [`SpawnResponse`]
//! - `GET {base}/calls/{call_id}` returns a [`CallStatus`]
//! - `POST {base}/calls/{call_id}/cancel` asks the service to stop the call

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::poll::{poll_until, PollPolicy};
use super::{ExecutionHandle, LaunchRequest, Launcher, Prober};
use crate::batch::Verdict;
use crate::error::{CancelError, ConfigError, LaunchError, ProbeError};

/// Configuration for [`RemoteFunctionAdapter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteFunctionConfig {
    /// Service root, e.g. `https://runner.example.com/v1`.
    pub base_url: String,
    /// Sent as a bearer token when set.
    pub api_token: Option<String>,
    /// Timeout for each individual HTTP request.
    pub request_timeout_secs: u64,
    pub poll: PollPolicy,
}

impl Default for RemoteFunctionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: None,
            request_timeout_secs: 30,
            poll: PollPolicy::default(),
        }
    }
}

impl RemoteFunctionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }
}

/// Body of `POST /spawn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub batch_id: String,
    pub task_id: String,
    pub model: String,
    pub agent: String,
    pub dataset: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Response of `POST /spawn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub call_id: String,
}

/// State of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    Running,
    /// The task runner finished; `passed` holds the result.
    Completed,
    /// The function hit its own execution limit.
    Timeout,
    /// The function crashed before producing a result.
    Error,
}

/// Response of `GET /calls/{call_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStatus {
    pub state: CallState,
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Runs tasks as calls on a remote function service.
pub struct RemoteFunctionAdapter {
    config: RemoteFunctionConfig,
    base_url: String,
    client: Client,
}

impl RemoteFunctionAdapter {
    pub fn new(config: RemoteFunctionConfig) -> Result<Self, ConfigError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "adapter.remote.base_url".to_string(),
                message: "must be set for the remote adapter".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "adapter.remote".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn fetch_status(&self, call_id: &str) -> Result<Option<Verdict>, ProbeError> {
        let url = format!("{}/calls/{}", self.base_url, call_id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProbeError::UnknownHandle(call_id.to_string()));
        }
        if status.is_server_error() {
            return Err(ProbeError::Transport(format!("HTTP {} from {}", status, url)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeError::Lost(format!("HTTP {}: {}", status, body)));
        }

        let call: CallStatus = response
            .json()
            .await
            .map_err(|e| ProbeError::Lost(format!("malformed call status: {}", e)))?;
        verdict_for(call)
    }
}

fn verdict_for(call: CallStatus) -> Result<Option<Verdict>, ProbeError> {
    match call.state {
        CallState::Pending | CallState::Running => Ok(None),
        CallState::Completed => Ok(Some(if call.passed == Some(true) {
            Verdict::Passed
        } else {
            Verdict::Failed(call.error.unwrap_or_else(|| "task did not pass".to_string()))
        })),
        CallState::Timeout => Ok(Some(Verdict::Failed(
            call.error
                .unwrap_or_else(|| "remote function timed out".to_string()),
        ))),
        CallState::Error => Err(ProbeError::Lost(
            call.error
                .unwrap_or_else(|| "remote function failed".to_string()),
        )),
    }
}

#[async_trait]
impl Launcher for RemoteFunctionAdapter {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<ExecutionHandle, LaunchError> {
        let body = SpawnRequest {
            batch_id: request.batch_id.to_string(),
            task_id: request.task_id.to_string(),
            model: request.config.model.clone(),
            agent: request.config.agent.clone(),
            dataset: request.config.dataset.clone(),
            env: request.config.env.clone(),
        };
        let response = self
            .authorize(self.client.post(format!("{}/spawn", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(|e| LaunchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LaunchError::Rejected(format!("HTTP {}: {}", status, body)));
        }

        let spawned: SpawnResponse = response
            .json()
            .await
            .map_err(|e| LaunchError::Transport(format!("malformed spawn response: {}", e)))?;
        debug!(task_id = %request.task_id, call_id = %spawned.call_id, "Spawned remote call");
        Ok(ExecutionHandle::new(request.task_id.clone(), spawned.call_id))
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), CancelError> {
        let url = format!("{}/calls/{}/cancel", self.base_url, handle.token());
        let response = self
            .authorize(self.client.post(&url))
            .send()
            .await
            .map_err(|e| CancelError::Failed(e.to_string()))?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(CancelError::UnknownHandle(handle.token().to_string())),
            s => Err(CancelError::Failed(format!("HTTP {} from {}", s, url))),
        }
    }
}

#[async_trait]
impl Prober for RemoteFunctionAdapter {
    async fn probe(
        &self,
        handle: &ExecutionHandle,
        timeout: Duration,
    ) -> Result<Verdict, ProbeError> {
        let call_id = handle.token();
        poll_until(&self.config.poll, timeout, || self.fetch_status(call_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_base_url() {
        let result = RemoteFunctionAdapter::new(RemoteFunctionConfig::default());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let adapter =
            RemoteFunctionAdapter::new(RemoteFunctionConfig::new("http://runner/v1/")).unwrap();
        assert_eq!(adapter.base_url, "http://runner/v1");
    }

    #[test]
    fn test_verdict_mapping() {
        let status = |state, passed, error: Option<&str>| CallStatus {
            state,
            passed,
            error: error.map(String::from),
        };

        assert_eq!(verdict_for(status(CallState::Running, None, None)).unwrap(), None);
        assert_eq!(
            verdict_for(status(CallState::Completed, Some(true), None)).unwrap(),
            Some(Verdict::Passed)
        );
        assert_eq!(
            verdict_for(status(CallState::Completed, Some(false), None)).unwrap(),
            Some(Verdict::Failed("task did not pass".into()))
        );
        assert!(matches!(
            verdict_for(status(CallState::Timeout, Some(false), None)).unwrap(),
            Some(Verdict::Failed(_))
        ));
        assert!(matches!(
            verdict_for(status(CallState::Error, None, Some("OOM"))),
            Err(ProbeError::Lost(ref m)) if m == "OOM"
        ));
    }

    #[test]
    fn test_call_status_wire_format() {
        let call: CallStatus =
            serde_json::from_str(r#"{"state": "completed", "passed": true}"#).unwrap();
        assert_eq!(call.state, CallState::Completed);
        assert_eq!(call.passed, Some(true));
        assert!(call.error.is_none());
    }
}
