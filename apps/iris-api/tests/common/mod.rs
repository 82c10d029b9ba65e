#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use parking_lot::Mutex;

use iris_api::broker::MemoryBroker;
use iris_api::config::Config;
use iris_api::db::jobs::MemoryJobStore;
use iris_api::workflow::{RunHandle, StartWorkflow, WorkflowError, WorkflowTrigger};
use iris_api::AppState;

/// Workflow trigger that records every start request instead of calling out.
#[derive(Default)]
pub struct RecordingWorkflows {
    pub started: Mutex<Vec<StartWorkflow>>,
    fail: bool,
}

impl RecordingWorkflows {
    /// A trigger whose starts are always rejected.
    pub fn failing() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn started(&self) -> Vec<StartWorkflow> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl WorkflowTrigger for RecordingWorkflows {
    async fn start_workflow(&self, request: StartWorkflow) -> Result<RunHandle, WorkflowError> {
        self.started.lock().push(request.clone());
        if self.fail {
            return Err(WorkflowError::Rejected {
                status: 503,
                body: "workflow service unavailable".to_string(),
            });
        }
        Ok(RunHandle {
            workflow_id: request.workflow_id,
            run_id: "run-1".to_string(),
        })
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        redis_url: "redis://localhost:6379/".to_string(),
        port: 0,
        workflow_url: "http://localhost:7233".to_string(),
        workflow_task_queue: "job-application".to_string(),
        heartbeat_interval: Duration::from_secs(30),
        subscribe_timeout: Duration::from_secs(5),
    }
}

/// Everything a test may want to poke at behind the router.
pub struct TestContext {
    pub state: AppState,
    pub broker: Arc<MemoryBroker>,
    pub workflows: Arc<RecordingWorkflows>,
}

/// Build an AppState over the in-memory broker and job store.
pub fn test_state_with(config: Config, workflows: RecordingWorkflows) -> TestContext {
    let broker = Arc::new(MemoryBroker::new());
    let workflows = Arc::new(workflows);
    let state = AppState::new(
        config,
        broker.clone(),
        Arc::new(MemoryJobStore::new()),
        workflows.clone(),
    );
    TestContext {
        state,
        broker,
        workflows,
    }
}

pub fn test_state() -> TestContext {
    test_state_with(test_config(), RecordingWorkflows::default())
}

/// Build the full application router wired to a fresh test state.
pub fn test_app() -> (Router, TestContext) {
    let ctx = test_state();
    let app = iris_api::routes::router().with_state(ctx.state.clone());
    (app, ctx)
}

/// Start a real TCP server for streaming tests. The server runs in the
/// background for the rest of the test.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = iris_api::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Poll `check` until it returns true or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
