//! Remote function adapter against a mock function service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bench_fleet::adapter::{
    AdapterPair, CallState, CallStatus, PollPolicy, RemoteFunctionAdapter, RemoteFunctionConfig,
    SpawnRequest, SpawnResponse,
};
use bench_fleet::batch::{BatchStatus, Outcome, TaskId};
use bench_fleet::scheduler::{BatchOptions, Scheduler};

#[derive(Default)]
struct MockService {
    /// call id -> (task id, polls so far)
    calls: Mutex<HashMap<String, (String, u32)>>,
    spawned: Mutex<Vec<SpawnRequest>>,
    cancelled: Mutex<Vec<String>>,
    auth_headers: Mutex<Vec<String>>,
}

type Shared = Arc<MockService>;

async fn spawn(
    State(svc): State<Shared>,
    headers: HeaderMap,
    Json(req): Json<SpawnRequest>,
) -> Result<Json<SpawnResponse>, StatusCode> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        svc.auth_headers.lock().unwrap().push(auth.to_string());
    }
    if req.task_id == "rejected" {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let call_id = format!("call-{}", req.task_id);
    svc.calls
        .lock()
        .unwrap()
        .insert(call_id.clone(), (req.task_id.clone(), 0));
    svc.spawned.lock().unwrap().push(req);
    Ok(Json(SpawnResponse { call_id }))
}

async fn status(
    State(svc): State<Shared>,
    Path(call_id): Path<String>,
) -> Result<Json<CallStatus>, StatusCode> {
    let mut calls = svc.calls.lock().unwrap();
    let (task_id, polls) = calls.get_mut(&call_id).ok_or(StatusCode::NOT_FOUND)?;
    *polls += 1;

    let running = CallStatus {
        state: CallState::Running,
        passed: None,
        error: None,
    };
    let status = match (task_id.as_str(), *polls) {
        ("hang", _) => running,
        (_, 1) => running,
        ("pass", _) => CallStatus {
            state: CallState::Completed,
            passed: Some(true),
            error: None,
        },
        ("fail", _) => CallStatus {
            state: CallState::Completed,
            passed: Some(false),
            error: Some("1 of 3 tests failed".to_string()),
        },
        _ => CallStatus {
            state: CallState::Error,
            passed: None,
            error: Some("sandbox crashed".to_string()),
        },
    };
    Ok(Json(status))
}

async fn cancel(State(svc): State<Shared>, Path(call_id): Path<String>) -> StatusCode {
    svc.cancelled.lock().unwrap().push(call_id);
    StatusCode::OK
}

async fn start_mock() -> (SocketAddr, Shared) {
    let svc: Shared = Arc::new(MockService::default());
    let app = Router::new()
        .route("/spawn", post(spawn))
        .route("/calls/{call_id}", get(status))
        .route("/calls/{call_id}/cancel", post(cancel))
        .with_state(Arc::clone(&svc));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, svc)
}

fn scheduler_for(addr: SocketAddr) -> Scheduler {
    let config = RemoteFunctionConfig::new(format!("http://{addr}/"))
        .with_api_token("secret")
        .with_poll(PollPolicy::fixed(Duration::from_millis(10)));
    let adapter = RemoteFunctionAdapter::new(config).unwrap();
    Scheduler::from_pair(AdapterPair::from_adapter(adapter))
}

fn ids(raw: &[&str]) -> Vec<TaskId> {
    raw.iter().map(|s| TaskId::from(*s)).collect()
}

#[tokio::test]
async fn test_remote_batch_outcomes() {
    let (addr, svc) = start_mock().await;

    let state = scheduler_for(addr)
        .run_batch(
            ids(&["pass", "fail", "crash", "rejected"]),
            BatchOptions::new(4).with_per_task_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let snap = state.snapshot();
    assert_eq!(snap.status, BatchStatus::Completed);
    assert_eq!(snap.passed, 1);
    assert_eq!(snap.failed, 3);

    let outcome = |task: &str| snap.tasks[&TaskId::from(task)].outcome.clone();
    assert_eq!(outcome("pass"), Outcome::Passed);
    assert_eq!(
        outcome("fail"),
        Outcome::Failed {
            reason: "1 of 3 tests failed".into()
        }
    );
    assert!(matches!(outcome("crash"), Outcome::ProbeError { .. }));
    assert!(matches!(outcome("rejected"), Outcome::LaunchFailed { .. }));

    let spawned = svc.spawned.lock().unwrap();
    assert_eq!(spawned.len(), 3);
    assert!(spawned
        .iter()
        .all(|req| req.batch_id == state.batch_id().as_str()));
    assert!(svc
        .auth_headers
        .lock()
        .unwrap()
        .iter()
        .all(|h| h == "Bearer secret"));
    assert!(svc.cancelled.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_timeout_cancels_call() {
    let (addr, svc) = start_mock().await;

    let state = scheduler_for(addr)
        .run_batch(
            ids(&["hang"]),
            BatchOptions::new(1).with_per_task_timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    assert_eq!(
        state.snapshot().tasks[&TaskId::from("hang")].outcome,
        Outcome::TimedOut
    );
    assert_eq!(*svc.cancelled.lock().unwrap(), vec!["call-hang".to_string()]);
}
