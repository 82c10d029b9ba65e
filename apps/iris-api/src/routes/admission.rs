//! Read-only view of admission slot counters.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/admission/{provider}/{key_index}", get(active_slots))
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct SlotUsageResponse {
    pub provider: String,
    pub key_index: u32,
    /// Slots currently held. May read negative after unmatched releases.
    pub active: i64,
}

#[utoipa::path(
    get,
    path = "/admission/{provider}/{key_index}",
    tag = "Admission",
    params(
        ("provider" = String, Path, description = "External resource provider"),
        ("key_index" = u32, Path, description = "Credential index within the provider"),
    ),
    responses(
        (status = 200, description = "Current slot usage", body = SlotUsageResponse),
        (status = 500, description = "Broker unavailable", body = crate::error::ApiErrorBody),
    ),
)]
pub async fn active_slots(
    State(state): State<AppState>,
    Path((provider, key_index)): Path<(String, u32)>,
) -> Result<Json<SlotUsageResponse>, ApiError> {
    let active = state.admission.active_slots(&provider, key_index).await?;
    Ok(Json(SlotUsageResponse {
        provider,
        key_index,
        active,
    }))
}
