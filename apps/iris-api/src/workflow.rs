//! Starting durable workflow executions on the external workflow service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("workflow service rejected start ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// A request to start one execution. `workflow_id` doubles as the idempotency
/// key: starting the same id twice yields the same execution.
#[derive(Debug, Clone)]
pub struct StartWorkflow {
    pub workflow_type: String,
    pub workflow_id: String,
    pub input: Value,
    pub execution_timeout: Duration,
    pub task_timeout: Duration,
}

/// Identifies a started execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub workflow_id: String,
    pub run_id: String,
}

#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    async fn start_workflow(&self, request: StartWorkflow) -> Result<RunHandle, WorkflowError>;
}

#[derive(Debug, Serialize)]
struct StartBody<'a> {
    workflow_id: &'a str,
    workflow_type: &'a str,
    task_queue: &'a str,
    input: &'a Value,
    execution_timeout_secs: u64,
    task_timeout_secs: u64,
}

/// Talks to the workflow service's HTTP API.
#[derive(Clone)]
pub struct HttpWorkflowTrigger {
    base_url: String,
    task_queue: String,
    http: reqwest::Client,
}

impl HttpWorkflowTrigger {
    pub fn new(base_url: &str, task_queue: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            task_queue: task_queue.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WorkflowTrigger for HttpWorkflowTrigger {
    async fn start_workflow(&self, request: StartWorkflow) -> Result<RunHandle, WorkflowError> {
        let url = format!("{}/api/v1/workflows", self.base_url);
        let body = StartBody {
            workflow_id: &request.workflow_id,
            workflow_type: &request.workflow_type,
            task_queue: &self.task_queue,
            input: &request.input,
            execution_timeout_secs: request.execution_timeout.as_secs(),
            task_timeout_secs: request.task_timeout.as_secs(),
        };

        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkflowError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let handle: RunHandle = resp.json().await?;
        tracing::info!(
            workflow_type = %request.workflow_type,
            workflow_id = %handle.workflow_id,
            run_id = %handle.run_id,
            "workflow started"
        );
        Ok(handle)
    }
}
