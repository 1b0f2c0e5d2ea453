//! Control API authentication.
//!
//! Every route except `/api/health` requires `Authorization: Bearer <key>`
//! where the key is `[control] api_key`. This is the local caller's key, not
//! the rider token: the rider token travels in request bodies and is only
//! ever sent on to the backend.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected control key, injected as a router extension.
#[derive(Clone)]
pub struct ControlKey(pub String);

/// Reject requests without a matching bearer key.
///
/// - `401` when the header is missing or not `Bearer`
/// - `403` when the key does not match
/// - `500` when no [`ControlKey`] extension is installed
pub async fn require_control_key(request: Request, next: Next) -> Response {
    let Some(ControlKey(expected)) = request.extensions().get::<ControlKey>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid control key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Compare without short-circuiting. Runs over all of `expected` whatever
/// the length of `provided`.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}
