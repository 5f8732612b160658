use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

// Failure modes of producing an access token for one account. Both trigger
// failover to the next candidate; Auth additionally means the account is
// unusable until re-authorized.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("auth error: {0}")]
    Auth(String),

    #[error("transient auth error: {0}")]
    Transient(String),
}

// Rendered to the client when every candidate failed without producing an
// upstream response to pass through.
pub fn upstream_unavailable_response(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": {
                "type": "upstream_unavailable",
                "message": message,
            }
        })),
    )
        .into_response()
}

pub fn invalid_request_response(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "type": "error",
            "error": {
                "type": "invalid_request_error",
                "message": message,
            }
        })),
    )
        .into_response()
}
