//! Tracking service facade.
//!
//! The three caller-facing operations live here:
//!
//! - [`TrackingService::start_background_location`]: permission gate, persist
//!   the rider token, start the loop on the [`TaskHost`] unless it is already
//!   running;
//! - [`TrackingService::stop_background_location`]: stop the loop, then drop
//!   the session bookkeeping (and the token, by default);
//! - [`TrackingService::get_remote_tracking_status`]: one-shot directive poll.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::BackendError;
use crate::config::TrackingConfig;
use crate::host::{TaskHost, TaskInfo, TaskOptions};
use crate::permission::{Granted, PermissionDenied, PermissionGate};
use crate::scheduler::{Scheduler, SchedulerConfig, TrackerDeps};
use crate::state::{StateKeys, TrackingState};
use crate::status::TrackerStatus;
use crate::store::StoreError;
use crate::switch::Directive;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Permission(#[from] PermissionDenied),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no rider token given and none stored")]
    NoToken,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Parameters of a start request. Missing cadences fall back to `[tracking]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    pub token: String,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub status_poll_ms: Option<u64>,
}

/// Point-in-time view for `GET /api/tracking`.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSnapshot {
    pub running: bool,
    pub authorized: bool,
    pub task: Option<TaskInfo>,
    pub status: TrackerStatus,
}

pub struct TrackingService {
    deps: TrackerDeps,
    tracking: TrackingConfig,
    state: TrackingState,
    gate: PermissionGate,
    host: TaskHost,
    status: Arc<Mutex<TrackerStatus>>,
}

impl TrackingService {
    pub fn new(deps: TrackerDeps, tracking: TrackingConfig, gate: PermissionGate) -> Self {
        let state = TrackingState::new(
            deps.store.clone(),
            StateKeys::with_prefix(&tracking.key_prefix),
            tracking.lock_ttl_ms,
        );
        Self {
            deps,
            tracking,
            state,
            gate,
            host: TaskHost::new(),
            status: Arc::new(Mutex::new(TrackerStatus::new())),
        }
    }

    pub async fn ensure_permission(&self) -> Result<Granted, PermissionDenied> {
        self.gate.ensure().await
    }

    /// Check permission, then [`start_tracking`](Self::start_tracking).
    /// Returns whether a new loop was spawned.
    pub async fn start_background_location(
        &self,
        request: StartRequest,
    ) -> Result<bool, ServiceError> {
        self.ensure_permission().await?;

        let token = request.token.trim();
        if token.is_empty() {
            return Err(ServiceError::InvalidRequest("token must not be empty".into()));
        }
        let interval_ms = request.interval_ms.unwrap_or(self.tracking.interval_ms);
        let status_poll_ms = request.status_poll_ms.unwrap_or(self.tracking.status_poll_ms);
        if interval_ms == 0 || status_poll_ms == 0 {
            return Err(ServiceError::InvalidRequest(
                "interval_ms and status_poll_ms must be positive".into(),
            ));
        }

        self.start_tracking(token, interval_ms, status_poll_ms).await
    }

    /// Persist the token and start the loop unless it is already running.
    /// A running loop keeps its cadence but picks up the new token on its
    /// next cycle.
    pub async fn start_tracking(
        &self,
        token: &str,
        interval_ms: u64,
        status_poll_ms: u64,
    ) -> Result<bool, ServiceError> {
        self.state.save_auth(token).await?;

        let config = SchedulerConfig::from_tracking(&self.tracking, interval_ms, status_poll_ms);
        let scheduler = Scheduler::new(config, self.deps.clone(), self.status.clone());
        Ok(self
            .host
            .start(TaskOptions::tracking(interval_ms, status_poll_ms), move |cancel| {
                scheduler.run(cancel)
            })
            .await)
    }

    /// Stop the loop and wait for it, then clear lock and last-sent (and the
    /// token when `clear_auth`). Returns whether a running loop was stopped.
    pub async fn stop_background_location(&self, clear_auth: bool) -> Result<bool, ServiceError> {
        let stopped = self.host.stop().await;
        self.state.clear_session(clear_auth).await?;
        info!(
            "Tracker: stop requested (clear_auth={clear_auth}, was running={stopped})"
        );
        Ok(stopped)
    }

    /// Poll the remote switch once with `token`, or the stored token.
    pub async fn get_remote_tracking_status(
        &self,
        token: Option<&str>,
    ) -> Result<Directive, ServiceError> {
        let token = match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => t.to_string(),
            None => self
                .state
                .load_auth()
                .await?
                .map(|auth| auth.token)
                .ok_or(ServiceError::NoToken)?,
        };
        Ok(self.deps.switch.fetch_directive(&token).await?)
    }

    /// Restart the loop after a process restart if a token is persisted.
    pub async fn resume_if_authorized(&self) -> Result<bool, ServiceError> {
        let Some(auth) = self.state.load_auth().await? else {
            return Ok(false);
        };
        if let Err(e) = self.ensure_permission().await {
            warn!("Tracker: stored session found but {e}, not resuming");
            return Ok(false);
        }
        info!("Tracker: resuming stored tracking session");
        self.start_tracking(
            &auth.token,
            self.tracking.interval_ms,
            self.tracking.status_poll_ms,
        )
        .await
    }

    pub async fn snapshot(&self) -> Result<TrackingSnapshot, ServiceError> {
        Ok(TrackingSnapshot {
            running: self.host.is_running().await,
            authorized: self.state.load_auth().await?.is_some(),
            task: self.host.current().await,
            status: self.status.lock().await.clone(),
        })
    }

    /// Stop the loop for process exit. The persisted session is kept so the
    /// next start resumes it.
    pub async fn shutdown(&self) {
        if let Some(exit) = self.host.shutdown().await {
            info!("Tracker: loop stopped for shutdown ({})", exit.as_str());
        }
    }
}
