//! Real-time endpoints: the SSE event stream and its companions.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::Instrument;
use utoipa::ToSchema;

use iris_common::id::{prefix, prefixed_ulid};

use crate::auth::middleware::Recipient;
use crate::error::ApiError;
use crate::realtime::{Action, EventSink, SinkError};
use crate::AppState;

/// Frames queued between the bridge and the HTTP body. A client that stops
/// reading fills this and then stalls the bridge's writes.
const FRAME_BUFFER: usize = 16;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/realtime/events", get(stream_events))
        .route("/realtime/test", post(send_test_event))
        .route("/realtime/presence/{user_id}", get(presence))
}

/// Feeds bridge frames into a streaming response body.
struct BodySink {
    frames: mpsc::Sender<Bytes>,
}

#[async_trait]
impl EventSink for BodySink {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), SinkError> {
        self.frames
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| SinkError::PeerGone)
    }
}

// ---------------------------------------------------------------------------
// GET /realtime/events
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/realtime/events",
    tag = "Realtime",
    params(
        ("X-User-Id" = Option<String>, Header, description = "Recipient id; defaults to `anonymous`"),
    ),
    responses(
        (status = 200, description = "Server-sent event stream", content_type = "text/event-stream", body = String),
        (status = 500, description = "Could not subscribe", body = crate::error::ApiErrorBody),
    ),
)]
pub async fn stream_events(
    Recipient { user_id }: Recipient,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    // Subscribe before committing to a 200 so failures surface as JSON errors.
    let connection = state.bridge.connect(&user_id).await?;

    let connection_id = prefixed_ulid(prefix::CONNECTION);
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    let cancel = state.shutdown.child_token();
    // Dropping the response body (client gone) cancels the bridge.
    let body_guard = cancel.clone().drop_guard();

    let span = tracing::info_span!("event_stream", %connection_id, %user_id);
    tokio::spawn(
        async move {
            let mut sink = BodySink { frames: frames_tx };
            let reason = connection.run(&mut sink, &cancel).await;
            tracing::debug!(?reason, "bridge finished");
        }
        .instrument(span),
    );

    let body = stream::unfold((frames_rx, body_guard), |(mut rx, guard)| async move {
        let frame = rx.recv().await?;
        Some((Ok::<_, Infallible>(frame), (rx, guard)))
    });

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// POST /realtime/test
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct TestEventResponse {
    pub message: String,
    pub data: TestEventData,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TestEventData {
    /// The request body, echoed back.
    #[schema(value_type = Object)]
    pub message: Map<String, Value>,
    pub timestamp: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

#[utoipa::path(
    post,
    path = "/realtime/test",
    tag = "Realtime",
    params(
        ("X-User-Id" = Option<String>, Header, description = "Recipient id; defaults to `anonymous`"),
    ),
    request_body(content = Object, description = "Arbitrary JSON object"),
    responses(
        (status = 200, description = "Test event sent", body = TestEventResponse),
        (status = 400, description = "Body is not a JSON object"),
        (status = 500, description = "Publish failed", body = crate::error::ApiErrorBody),
    ),
)]
pub async fn send_test_event(
    Recipient { user_id }: Recipient,
    State(state): State<AppState>,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<TestEventResponse>, ApiError> {
    let data = TestEventData {
        message: body,
        timestamp: Utc::now().to_rfc3339(),
        user_id,
    };

    state
        .bus
        .publish_to_recipient(&data.user_id, Action::Notification, &data)
        .await?;

    tracing::info!(user_id = %data.user_id, "test event sent");
    Ok(Json(TestEventResponse {
        message: "Test event sent successfully".to_string(),
        data,
    }))
}

// ---------------------------------------------------------------------------
// GET /realtime/presence/{user_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct PresenceResponse {
    pub user_id: String,
    pub online: bool,
}

#[utoipa::path(
    get,
    path = "/realtime/presence/{user_id}",
    tag = "Realtime",
    params(
        ("user_id" = String, Path, description = "Recipient id"),
    ),
    responses(
        (status = 200, description = "Presence of the recipient", body = PresenceResponse),
        (status = 500, description = "Broker unavailable", body = crate::error::ApiErrorBody),
    ),
)]
pub async fn presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceResponse>, ApiError> {
    let online = state.presence.is_online(&user_id).await?;
    Ok(Json(PresenceResponse { user_id, online }))
}
