//! Location permission gate.
//!
//! Tracking must not start unless fine-grained location access is granted.
//! [`PermissionGate::ensure`] asks the [`PermissionSystem`] exactly once per
//! call and never retries; the caller decides what to do with a denial.
//!
//! On a Linux device the "permission" is access to the GNSS modem's AT port:
//! [`DeviceAccess`] grants fine location when the process can both read and
//! write the device node.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nix::unistd::{access, AccessFlags};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    FineLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Proof that the gate let us through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Granted;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PermissionDenied {
    #[error("location tracking is not supported on this platform")]
    PlatformNotSupported,
    #[error("fine location permission denied")]
    LocationDenied,
}

impl PermissionDenied {
    /// Stable machine-readable reason, used in control API error bodies.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::PlatformNotSupported => "PLATFORM_NOT_SUPPORTED",
            Self::LocationDenied => "LOCATION_DENIED",
        }
    }
}

#[async_trait]
pub trait PermissionSystem: Send + Sync {
    async fn request(&self, permission: Permission) -> PermissionStatus;
}

pub struct PermissionGate {
    system: Arc<dyn PermissionSystem>,
    platform_supported: bool,
}

impl PermissionGate {
    pub fn new(system: Arc<dyn PermissionSystem>) -> Self {
        Self {
            system,
            platform_supported: cfg!(any(target_os = "linux", target_os = "android")),
        }
    }

    #[must_use]
    pub fn with_platform_support(mut self, supported: bool) -> Self {
        self.platform_supported = supported;
        self
    }

    pub async fn ensure(&self) -> Result<Granted, PermissionDenied> {
        if !self.platform_supported {
            return Err(PermissionDenied::PlatformNotSupported);
        }
        match self.system.request(Permission::FineLocation).await {
            PermissionStatus::Granted => Ok(Granted),
            PermissionStatus::Denied => Err(PermissionDenied::LocationDenied),
        }
    }
}

/// Grants fine location when the GNSS device node is readable and writable.
pub struct DeviceAccess {
    device: PathBuf,
}

impl DeviceAccess {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

#[async_trait]
impl PermissionSystem for DeviceAccess {
    async fn request(&self, permission: Permission) -> PermissionStatus {
        match permission {
            Permission::FineLocation => {
                match access(&self.device, AccessFlags::R_OK | AccessFlags::W_OK) {
                    Ok(()) => {
                        info!("Permission: fine location granted ({})", self.device.display());
                        PermissionStatus::Granted
                    }
                    Err(e) => {
                        warn!(
                            "Permission: no read/write access to {}: {e}",
                            self.device.display()
                        );
                        PermissionStatus::Denied
                    }
                }
            }
        }
    }
}
