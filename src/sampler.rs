//! Single-shot GPS sampling.
//!
//! The scheduler never talks to a GNSS receiver directly: it asks a
//! [`Sampler`] for one fresh fix and gets back a [`GpsFix`] or a
//! [`LocationError`]. The sampler enforces the timeout and the freshness
//! request; the [`LocationProvider`] behind it does the device work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// One position reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// When the fix was taken (epoch milliseconds).
    pub captured_at_ms: u64,
    /// Altitude in metres, when the receiver reports it.
    pub altitude: Option<f64>,
    /// Horizontal dilution of precision.
    pub hdop: Option<f64>,
    /// Number of satellites used.
    pub satellites: Option<u32>,
}

/// Parameters for a single position request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRequest {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest acceptable cached fix. Zero means "never answer from cache".
    pub max_age: Duration,
    /// Ask the provider to wake the receiver if needed.
    pub force_fresh: bool,
}

impl PositionRequest {
    /// High-accuracy, uncached request bounded by `timeout`.
    #[must_use]
    pub fn fresh(timeout: Duration) -> Self {
        Self {
            high_accuracy: true,
            timeout,
            max_age: Duration::ZERO,
            force_fresh: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("no fix within {0:?}")]
    Timeout(Duration),
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location unavailable: {0}")]
    Unavailable(String),
}

/// Source of position readings (GNSS modem, fake, ...).
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self, request: PositionRequest) -> Result<GpsFix, LocationError>;
}

/// Takes exactly one fresh fix per call with a hard deadline.
#[derive(Clone)]
pub struct Sampler {
    provider: Arc<dyn LocationProvider>,
    timeout: Duration,
}

impl Sampler {
    pub fn new(provider: Arc<dyn LocationProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Request one high-accuracy, uncached fix. A provider that ignores the
    /// request timeout is cut off here.
    pub async fn sample_once(&self) -> Result<GpsFix, LocationError> {
        let request = PositionRequest::fresh(self.timeout);
        match tokio::time::timeout(self.timeout, self.provider.current_position(request)).await {
            Ok(result) => result,
            Err(_) => Err(LocationError::Timeout(self.timeout)),
        }
    }
}
