//! Tracking control endpoints.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::AppState;
use crate::service::{ServiceError, StartRequest};

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message.into()})))
}

/// Map a service failure onto an HTTP status and JSON error body.
fn service_error(e: ServiceError) -> ApiError {
    match e {
        ServiceError::Permission(denied) => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": denied.to_string(), "code": denied.code()})),
        ),
        ServiceError::InvalidRequest(msg) => bad_request(msg),
        ServiceError::NoToken => (
            StatusCode::CONFLICT,
            Json(json!({"error": ServiceError::NoToken.to_string()})),
        ),
        ServiceError::Backend(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": e.to_string(), "upstream_status": e.status()})),
        ),
        ServiceError::Store(e) => {
            warn!("Control: tracking state unavailable: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

/// `POST /api/tracking/start` — body `{token, interval_ms?, status_poll_ms?}`.
///
/// `started` is `false` when a loop was already running; the token is stored
/// either way.
pub async fn start(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: StartRequest = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid start request: {e}")))?;
    let started = state
        .service
        .start_background_location(request)
        .await
        .map_err(service_error)?;
    Ok(Json(json!({"started": started, "running": true})))
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    #[serde(default = "default_clear_auth")]
    clear_auth: bool,
}

fn default_clear_auth() -> bool {
    true
}

/// `POST /api/tracking/stop` — optional body `{clear_auth}` (default `true`).
pub async fn stop(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let clear_auth = if body.iter().all(u8::is_ascii_whitespace) {
        default_clear_auth()
    } else {
        serde_json::from_slice::<StopRequest>(&body)
            .map_err(|e| bad_request(format!("invalid stop request: {e}")))?
            .clear_auth
    };
    let stopped = state
        .service
        .stop_background_location(clear_auth)
        .await
        .map_err(service_error)?;
    Ok(Json(json!({"stopped": stopped, "clear_auth": clear_auth})))
}

/// `GET /api/tracking` — running flag, task info and counters.
pub async fn snapshot(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.service.snapshot().await.map_err(service_error)?;
    Ok(Json(json!(snapshot)))
}

#[derive(Debug, Deserialize)]
pub struct RemoteQuery {
    token: Option<String>,
}

/// `GET /api/tracking/remote?token=` — ask the backend once.
pub async fn remote(
    State(state): State<AppState>,
    Query(query): Query<RemoteQuery>,
) -> Result<Json<Value>, ApiError> {
    let directive = state
        .service
        .get_remote_tracking_status(query.token.as_deref())
        .await
        .map_err(service_error)?;
    Ok(Json(json!({"tracking": directive.as_str()})))
}
