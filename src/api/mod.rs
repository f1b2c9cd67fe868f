//! HTTP surface over a [`BatchRegistry`].
//!
//! | Method | Path                   | Purpose                         |
//! |--------|------------------------|---------------------------------|
//! | POST   | `/run`                 | submit a batch                  |
//! | GET    | `/status/{batch_id}`   | live snapshot                   |
//! | POST   | `/cancel/{batch_id}`   | request batch cancellation      |
//! | DELETE | `/batches/{batch_id}`  | drop a batch from the table     |
//! | GET    | `/batches`             | summaries of all tracked batches|
//! | GET    | `/health`              | liveness                        |
//! | GET    | `/metrics`             | Prometheus text exposition      |

pub mod error;
pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tracing::info;

use crate::metrics::metrics_handler;
use crate::registry::BatchRegistry;
use crate::scheduler::BatchOptions;

pub use error::ApiError;
pub use handlers::{CancelResponse, HealthResponse, RunRequest, RunResponse};

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<BatchRegistry>,
    /// Options applied when a request leaves a field unset.
    pub defaults: BatchOptions,
    /// Largest `parallel` a request may ask for.
    pub max_parallel: usize,
}

impl ApiState {
    pub fn new(registry: Arc<BatchRegistry>, defaults: BatchOptions, max_parallel: usize) -> Self {
        Self {
            registry,
            defaults,
            max_parallel,
        }
    }
}

/// Builds the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/run", post(handlers::run_batch))
        .route("/status/{batch_id}", get(handlers::batch_status))
        .route("/cancel/{batch_id}", post(handlers::cancel_batch))
        .route("/batches", get(handlers::list_batches))
        .route("/batches/{batch_id}", delete(handlers::remove_batch))
        .route("/health", get(handlers::health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
