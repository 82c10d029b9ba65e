//! Job application endpoints.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};

use crate::auth::middleware::Recipient;
use crate::db::jobs::Page;
use crate::error::{ApiError, ApiErrorBody};
use crate::models::job_application::{JobApplication, JobStatus};
use crate::realtime::Action;
use crate::workflow::StartWorkflow;
use crate::AppState;

pub const JOB_APPLICATION_WORKFLOW: &str = "JobApplicationWorkflow";
const EXECUTION_TIMEOUT: Duration = Duration::from_secs(40 * 60);
const TASK_TIMEOUT: Duration = Duration::from_secs(60);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs/apply", post(apply_for_job))
        .route("/jobs", get(list_jobs))
}

/// Execution id for an application's workflow. Stable per application, so a
/// retried start cannot launch a second execution.
pub fn workflow_id(application_id: &str) -> String {
    format!("job-application-{application_id}")
}

// ---------------------------------------------------------------------------
// POST /jobs/apply
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApplyRequest {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApplyResponse {
    pub message: String,
    pub id: String,
}

#[utoipa::path(
    post,
    path = "/jobs/apply",
    tag = "Jobs",
    request_body = ApplyRequest,
    responses(
        (status = 202, description = "Application accepted and workflow started", body = ApplyResponse),
        (status = 400, description = "Bad request", body = ApiErrorBody),
        (status = 409, description = "Url already submitted", body = ApiErrorBody),
        (status = 500, description = "Workflow could not be started", body = ApiErrorBody),
    ),
)]
pub async fn apply_for_job(
    Recipient { user_id }: Recipient,
    State(state): State<AppState>,
    Json(body): Json<ApplyRequest>,
) -> Result<(StatusCode, Json<ApplyResponse>), ApiError> {
    let url = body.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }

    let application = state.jobs.create(url).await?;

    let request = StartWorkflow {
        workflow_type: JOB_APPLICATION_WORKFLOW.to_string(),
        workflow_id: workflow_id(&application.id),
        input: json!({
            "url": application.url,
            "id_job_application": application.id,
        }),
        execution_timeout: EXECUTION_TIMEOUT,
        task_timeout: TASK_TIMEOUT,
    };

    let run = match state.workflows.start_workflow(request).await {
        Ok(run) => run,
        Err(err) => {
            if let Err(mark_err) = state.jobs.set_status(&application.id, JobStatus::Failed).await {
                tracing::error!(
                    application_id = %application.id,
                    err = ?mark_err,
                    "failed to mark application failed"
                );
            }
            return Err(err.into());
        }
    };

    tracing::info!(
        application_id = %application.id,
        workflow_id = %run.workflow_id,
        "job application initiated"
    );

    let update = json!({
        "id": application.id,
        "status": JobStatus::Processing,
        "workflow_id": run.workflow_id,
        "run_id": run.run_id,
    });
    if let Err(err) = state
        .bus
        .publish_to_recipient(&user_id, Action::WorkflowUpdate, &update)
        .await
    {
        tracing::warn!(application_id = %application.id, ?err, "workflow update not published");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(ApplyResponse {
            message: "Job application initiated".to_string(),
            id: application.id,
        }),
    ))
}

// ---------------------------------------------------------------------------
// GET /jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListJobsQuery {
    /// 1-based page number (default 1).
    pub page: Option<i64>,
    /// Page size, 1 to 100 (default 10).
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListJobsResponse {
    pub data: Vec<JobApplication>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

#[utoipa::path(
    get,
    path = "/jobs",
    tag = "Jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Page of job applications", body = ListJobsResponse),
        (status = 500, description = "Store unavailable", body = ApiErrorBody),
    ),
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let page = Page::new(query.page, query.limit);
    let (data, total) = state.jobs.list(page).await?;

    Ok(Json(ListJobsResponse {
        data,
        total,
        page: page.page,
        limit: page.limit,
    }))
}
