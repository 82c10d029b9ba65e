//! Recipient identity extraction.
//!
//! Identity is taken from the `X-User-Id` header as set by the upstream
//! gateway. Requests without one are served as [`ANONYMOUS`].

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");

pub const ANONYMOUS: &str = "anonymous";

/// The recipient a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: String,
}

/// Rejection returned when the identity header is unreadable.
pub struct RecipientError {
    message: &'static str,
}

impl IntoResponse for RecipientError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": "BAD_REQUEST",
                "message": self.message
            }
        });
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

impl<S> FromRequestParts<S> for Recipient
where
    S: Send + Sync,
{
    type Rejection = RecipientError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(&USER_ID_HEADER) else {
            return Ok(Self::anonymous());
        };

        let user_id = value.to_str().map_err(|_| RecipientError {
            message: "Invalid X-User-Id header",
        })?;
        let user_id = user_id.trim();

        if user_id.is_empty() {
            return Ok(Self::anonymous());
        }
        Ok(Recipient {
            user_id: user_id.to_string(),
        })
    }
}

impl Recipient {
    fn anonymous() -> Self {
        Recipient {
            user_id: ANONYMOUS.to_string(),
        }
    }
}
