//! GNSS fixes from a Quectel modem via AT commands.
//!
//! [`ModemGps`] is the device [`LocationProvider`]. The modem is opened
//! lazily on the first request, so the daemon can start before the USB
//! serial node appears. When `auto_enable` is set the GNSS engine is switched
//! on (`AT+QGPS=1`) right after opening; [`ModemGps::shutdown`] switches it
//! off again (`AT+QGPSEND`).
//!
//! Every request queries `AT+QGPSLOC=2` afresh, so no fix is ever served from
//! a local cache. While the engine reports "no fix yet" (CME ERROR 516) the
//! request keeps polling once a second until its timeout.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GpsConfig;
use crate::modem::Modem;
use crate::sampler::{GpsFix, LocationError, LocationProvider, PositionRequest};
use crate::util::epoch_ms;

/// Delay between `AT+QGPSLOC` attempts while the receiver is still searching.
const SEARCH_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
enum FixError {
    /// CME ERROR 516: engine running, no fix yet.
    Searching,
    Modem(String),
    Malformed(String),
}

/// Parse an `AT+QGPSLOC=2` response (decimal degrees).
///
/// ```text
/// +QGPSLOC: <UTC>,<lat>,<lon>,<hdop>,<alt>,<fix>,<cog>,<spkm>,<spkn>,<date>,<nsat>
/// ```
fn parse_qgpsloc(response: &str, captured_at_ms: u64) -> Result<GpsFix, FixError> {
    // Prefer a data line over ERROR: stale buffer bytes can carry both.
    let Some(line) = response.lines().find(|l| l.contains("+QGPSLOC:")) else {
        if response.contains("ERROR") && response.contains("516") {
            return Err(FixError::Searching);
        }
        if response.contains("ERROR") {
            return Err(FixError::Modem(response.trim().to_string()));
        }
        return Err(FixError::Malformed(format!(
            "no +QGPSLOC in response: {}",
            response.trim()
        )));
    };

    let data = line
        .split_once(':')
        .map(|(_, rest)| rest.trim())
        .ok_or_else(|| FixError::Malformed("malformed +QGPSLOC line".into()))?;
    let parts: Vec<&str> = data.split(',').map(str::trim).collect();
    if parts.len() < 11 {
        return Err(FixError::Malformed(format!(
            "expected 11 fields in QGPSLOC, got {}: {data}",
            parts.len()
        )));
    }

    let number = |idx: usize, name: &str| {
        parts[idx]
            .parse::<f64>()
            .map_err(|e| FixError::Malformed(format!("bad {name}: {e}")))
    };
    let latitude = number(1, "lat")?;
    let longitude = number(2, "lon")?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(FixError::Malformed(format!(
            "coordinates out of range: {latitude},{longitude}"
        )));
    }

    Ok(GpsFix {
        latitude,
        longitude,
        captured_at_ms,
        altitude: number(4, "alt").ok(),
        hdop: number(3, "hdop").ok(),
        satellites: parts[10].parse().ok(),
    })
}

/// Device location provider backed by a Quectel modem.
pub struct ModemGps {
    config: GpsConfig,
    modem: Mutex<Option<Modem>>,
}

impl ModemGps {
    pub fn new(config: GpsConfig) -> Self {
        Self {
            config,
            modem: Mutex::new(None),
        }
    }

    /// Open the modem on first use and enable GNSS if configured.
    async fn modem(&self) -> Result<Modem, LocationError> {
        let mut slot = self.modem.lock().await;
        if let Some(modem) = slot.as_ref() {
            return Ok(modem.clone());
        }

        let modem = Modem::open(&self.config.device).map_err(|e| {
            if e.is_permission_denied() {
                LocationError::PermissionDenied
            } else {
                LocationError::Unavailable(e.to_string())
            }
        })?;
        if self.config.auto_enable {
            enable_gnss(&modem).await;
        }
        *slot = Some(modem.clone());
        Ok(modem)
    }

    /// Switch the GNSS engine off, if the modem was ever opened.
    pub async fn shutdown(&self) {
        let Some(modem) = self.modem.lock().await.take() else {
            return;
        };
        info!("GPS: disabling GNSS engine on {}", modem.device());
        match modem.command("AT+QGPSEND").await {
            Ok(resp) if resp.contains("OK") => info!("GPS: GNSS engine disabled"),
            Ok(resp) => debug!("GPS: AT+QGPSEND response: {}", resp.trim()),
            Err(e) => warn!("GPS: failed to disable GNSS: {e}"),
        }
    }
}

async fn enable_gnss(modem: &Modem) {
    info!("GPS: enabling GNSS engine on {}", modem.device());
    match modem.command("AT+QGPS=1").await {
        // 504 = "Session is ongoing": already enabled
        Ok(resp) if resp.contains("OK") || resp.contains("504") || resp.contains("ongoing") => {
            info!("GPS: GNSS engine enabled");
        }
        Ok(resp) => warn!("GPS: AT+QGPS=1 response: {}", resp.trim()),
        Err(e) => warn!("GPS: failed to send AT+QGPS=1: {e}"),
    }
}

#[async_trait]
impl LocationProvider for ModemGps {
    async fn current_position(&self, request: PositionRequest) -> Result<GpsFix, LocationError> {
        let modem = self.modem().await?;
        let deadline = Instant::now() + request.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LocationError::Timeout(request.timeout));
            }
            let resp = modem
                .command_with_timeout("AT+QGPSLOC=2", remaining)
                .await
                .map_err(|e| LocationError::Unavailable(e.to_string()))?;

            match parse_qgpsloc(&resp, epoch_ms()) {
                Ok(fix) => {
                    debug!(
                        "GPS: fix {:.6},{:.6} sats={:?} hdop={:?}",
                        fix.latitude, fix.longitude, fix.satellites, fix.hdop
                    );
                    return Ok(fix);
                }
                Err(FixError::Searching) if request.force_fresh => {
                    debug!("GPS: searching for satellites...");
                    tokio::time::sleep(SEARCH_RETRY.min(remaining)).await;
                }
                Err(FixError::Searching) => {
                    return Err(LocationError::Unavailable("searching".into()));
                }
                Err(FixError::Modem(msg) | FixError::Malformed(msg)) => {
                    return Err(LocationError::Unavailable(msg));
                }
            }
        }
    }
}
