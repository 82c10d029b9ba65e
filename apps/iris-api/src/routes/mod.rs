pub mod admission;
pub mod health;
pub mod jobs;
pub mod realtime;

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(realtime::router())
        .merge(jobs::router())
        .merge(admission::router())
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        realtime::stream_events,
        realtime::send_test_event,
        realtime::presence,
        jobs::apply_for_job,
        jobs::list_jobs,
        admission::active_slots,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::models::job_application::JobApplication,
            crate::models::job_application::JobStatus,
            health::HealthResponse,
            realtime::TestEventResponse,
            realtime::TestEventData,
            realtime::PresenceResponse,
            jobs::ApplyRequest,
            jobs::ApplyResponse,
            jobs::ListJobsResponse,
            admission::SlotUsageResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Realtime", description = "Server-sent events and presence"),
        (name = "Jobs", description = "Job applications"),
        (name = "Admission", description = "Concurrency slot usage"),
    )
)]
pub struct ApiDoc;
