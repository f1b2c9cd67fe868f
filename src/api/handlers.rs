//! Route handlers.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use super::ApiState;
use crate::batch::{BatchId, BatchSnapshot, BatchStatus, TaskId};
use crate::registry::BatchSummary;

/// Body of `POST /run`. Omitted fields fall back to the service defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub batch_id: BatchId,
    pub status: String,
    pub message: String,
    pub task_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub batch_id: BatchId,
    /// Status observed when the request arrived.
    pub previous_status: BatchStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub active_batches: usize,
}

/// `POST /run`
pub async fn run_batch(
    State(state): State<ApiState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    if request.task_ids.is_empty() {
        return Err(ApiError::bad_request("No tasks specified"));
    }

    let mut options = state.defaults.clone();
    if let Some(parallel) = request.parallel {
        if parallel > state.max_parallel {
            return Err(ApiError::bad_request(format!(
                "Maximum {} parallel tasks allowed",
                state.max_parallel
            )));
        }
        options = options.with_concurrency(parallel);
    }
    if let Some(secs) = request.timeout_secs {
        options = options.with_per_task_timeout(Duration::from_secs(secs));
    }
    if let Some(model) = request.model {
        options.launch.model = model;
    }
    if let Some(agent) = request.agent {
        options.launch.agent = agent;
    }
    if let Some(dataset) = request.dataset {
        options.launch.dataset = dataset;
    }

    let task_count = request.task_ids.len();
    let task_ids: Vec<TaskId> = request.task_ids.into_iter().map(TaskId::from).collect();
    let batch_id = state.registry.submit(task_ids, options)?;

    info!(batch_id = %batch_id, task_count, "Accepted batch over HTTP");
    Ok(Json(RunResponse {
        batch_id,
        status: "started".to_string(),
        message: format!("Started {} tasks", task_count),
        task_count,
    }))
}

/// `GET /status/{batch_id}`
pub async fn batch_status(
    State(state): State<ApiState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchSnapshot>, ApiError> {
    let snapshot = state.registry.status(&BatchId::from(batch_id))?;
    Ok(Json(snapshot))
}

/// `POST /cancel/{batch_id}`
pub async fn cancel_batch(
    State(state): State<ApiState>,
    Path(batch_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let batch_id = BatchId::from(batch_id);
    let previous_status = state.registry.cancel(&batch_id)?;
    let message = if previous_status.is_finished() {
        format!("Batch already {}", previous_status)
    } else {
        "Cancellation requested".to_string()
    };
    Ok(Json(CancelResponse {
        batch_id,
        previous_status,
        message,
    }))
}

/// `DELETE /batches/{batch_id}`
pub async fn remove_batch(
    State(state): State<ApiState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchSnapshot>, ApiError> {
    let snapshot = state.registry.remove(&BatchId::from(batch_id))?;
    Ok(Json(snapshot))
}

/// `GET /batches`
pub async fn list_batches(State(state): State<ApiState>) -> Json<Vec<BatchSummary>> {
    Json(state.registry.list())
}

/// `GET /health`
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        active_batches: state.registry.running(),
    })
}
