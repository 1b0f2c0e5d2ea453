//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::AppState;

/// `GET /api/health` — liveness probe with the tracking task flag.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let tracking = state
        .service
        .snapshot()
        .await
        .map_or(false, |snapshot| snapshot.running);

    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "tracking": tracking,
    }))
}
