//! Location reporting.

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{BackendClient, BackendError};
use crate::sampler::GpsFix;

/// Delivers one fix to the backend. A `401` must come back as an error for
/// which [`BackendError::is_unauthorized`] holds.
#[async_trait]
pub trait LocationReporter: Send + Sync {
    async fn report(&self, token: &str, fix: &GpsFix) -> Result<(), BackendError>;
}

#[async_trait]
impl LocationReporter for BackendClient {
    async fn report(&self, token: &str, fix: &GpsFix) -> Result<(), BackendError> {
        let ack = self.post_location(token, fix).await?;
        debug!(
            "Reporter: sent {:.6},{:.6} (ack {ack})",
            fix.latitude, fix.longitude
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::{client_for, spawn_fake_backend};

    fn fix() -> GpsFix {
        GpsFix {
            latitude: -33.8688,
            longitude: 151.2093,
            captured_at_ms: 1_700_000_000_000,
            altitude: Some(12.0),
            hdop: Some(0.9),
            satellites: Some(9),
        }
    }

    #[tokio::test]
    async fn report_posts_only_coordinates() {
        let (fake, addr) = spawn_fake_backend().await;
        client_for(addr).report("rider-token", &fix()).await.unwrap();

        let locations = fake.locations.lock().unwrap();
        assert_eq!(locations.len(), 1);
        let body = locations[0].as_object().unwrap();
        assert_eq!(body.len(), 2);
        assert!(body.contains_key("latitude"));
        assert!(body.contains_key("longitude"));
        assert_eq!(
            *fake.auth_headers.lock().unwrap(),
            vec!["Bearer rider-token"]
        );
    }

    #[tokio::test]
    async fn any_2xx_is_success() {
        let (fake, addr) = spawn_fake_backend().await;
        *fake.location_status.lock().unwrap() = 201;
        assert!(client_for(addr).report("t", &fix()).await.is_ok());
    }

    #[tokio::test]
    async fn unauthorized_is_distinguished() {
        let (fake, addr) = spawn_fake_backend().await;
        *fake.location_status.lock().unwrap() = 401;
        let err = client_for(addr).report("t", &fix()).await.unwrap_err();
        assert!(err.is_unauthorized());
    }
}
