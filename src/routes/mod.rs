//! Control API.
//!
//! | Method | Path                   | Auth | Description                          |
//! |--------|------------------------|------|--------------------------------------|
//! | GET    | `/api/health`          | No   | Liveness probe                       |
//! | POST   | `/api/tracking/start`  | Yes  | Start background location            |
//! | POST   | `/api/tracking/stop`   | Yes  | Stop, optionally keeping the token   |
//! | GET    | `/api/tracking`        | Yes  | Task state and tracker counters      |
//! | GET    | `/api/tracking/remote` | Yes  | One-shot remote directive poll       |

pub mod health;
pub mod tracking;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{require_control_key, ControlKey};
use crate::config::Config;
use crate::service::TrackingService;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<TrackingService>,
    /// For uptime in `/api/health`.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, service: Arc<TrackingService>) -> Self {
        Self {
            config,
            service,
            start_time: Instant::now(),
        }
    }
}

/// Build the full control router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/tracking", get(tracking::snapshot))
        .route("/api/tracking/start", post(tracking::start))
        .route("/api/tracking/stop", post(tracking::stop))
        .route("/api/tracking/remote", get(tracking::remote))
        .layer(middleware::from_fn(require_control_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ControlKey(state.config.control.api_key.clone())))
        .layer(ConcurrencyLimitLayer::new(
            state.config.control.max_concurrent_requests.max(1),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
