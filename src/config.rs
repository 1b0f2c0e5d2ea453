//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `RIDER_TRACKER_BACKEND_URL`,
//!    `RIDER_TRACKER_API_KEY`, `RIDER_TRACKER_LISTEN`, `RIDER_TRACKER_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `rider-tracker.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [backend]
//! base_url = "https://api.example.com"
//! request_timeout_ms = 20000
//! connect_timeout_ms = 10000
//!
//! [tracking]
//! interval_ms = 60000        # send a fix at most this often
//! status_poll_ms = 15000     # check the remote switch this often
//! lock_ttl_ms = 30000
//! min_sleep_ms = 1000
//! error_backoff_ms = 2000
//! sample_timeout_ms = 20000
//! key_prefix = "FD"
//!
//! [store]
//! data_dir = "/var/lib/rider-tracker"
//!
//! [control]
//! listen = "127.0.0.1:1338"
//! api_key = "your-secret-key"
//!
//! [gps]
//! device = "/dev/ttyUSB2"
//! auto_enable = true
//!
//! [connectivity]
//! probe_timeout_ms = 3000
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Rider backend API endpoint and HTTP limits.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the rider API (trailing slash optional). Override with
    /// `RIDER_TRACKER_BACKEND_URL`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in milliseconds (default 20 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// TCP/TLS connect timeout in milliseconds (default 10 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Scheduler cadence and bookkeeping settings.
///
/// `interval_ms` and `status_poll_ms` are only the defaults used when a start
/// request does not carry its own values.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Minimum gap between two accepted location reports (default 60 000).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// How often the remote start/stop switch is polled (default 15 000).
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
    /// Age after which a send lock is considered abandoned (default 30 000).
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Floor for the inter-cycle sleep (default 1000).
    #[serde(default = "default_min_sleep_ms")]
    pub min_sleep_ms: u64,
    /// Sleep after an unexpected cycle error (default 2000).
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Upper bound for a single GPS fix request (default 20 000).
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,
    /// Namespace prefix for persisted keys (default `FD`).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Persistent state location.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory holding `tracking-state.json`. Default `/var/lib/rider-tracker`.
    /// Override with `RIDER_TRACKER_DATA_DIR`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Local control API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Socket address to bind (default `127.0.0.1:1338`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pre-shared Bearer token for the control API. Override with
    /// `RIDER_TRACKER_API_KEY`. Defaults to `"change-me"`, which triggers a
    /// startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Maximum in-flight control requests (default 16).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// GNSS modem settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GpsConfig {
    /// AT command serial port of the Quectel modem (default `/dev/ttyUSB2`).
    #[serde(default = "default_gps_device")]
    pub device: String,
    /// Send `AT+QGPS=1` before the first fix request (default true).
    #[serde(default = "default_auto_enable")]
    pub auto_enable: bool,
}

/// Online check performed before each send.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
    /// TCP connect timeout for the backend probe (default 3000 ms).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Supervisor settings for `rider-tracker supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_request_timeout_ms() -> u64 {
    20_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_interval_ms() -> u64 {
    60_000
}
fn default_status_poll_ms() -> u64 {
    15_000
}
fn default_lock_ttl_ms() -> u64 {
    30_000
}
fn default_min_sleep_ms() -> u64 {
    1000
}
fn default_error_backoff_ms() -> u64 {
    2000
}
fn default_sample_timeout_ms() -> u64 {
    20_000
}
fn default_key_prefix() -> String {
    "FD".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/rider-tracker".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:1338".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_max_concurrent_requests() -> usize {
    16
}
fn default_gps_device() -> String {
    "/dev/ttyUSB2".to_string()
}
fn default_auto_enable() -> bool {
    true
}
fn default_probe_timeout_ms() -> u64 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            status_poll_ms: default_status_poll_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            min_sleep_ms: default_min_sleep_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            sample_timeout_ms: default_sample_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: default_api_key(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            device: default_gps_device(),
            auto_enable: default_auto_enable(),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl BackendConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `rider-tracker.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("rider-tracker.toml").exists() {
            let content = std::fs::read_to_string("rider-tracker.toml")
                .expect("Failed to read rider-tracker.toml");
            toml::from_str(&content).expect("Failed to parse rider-tracker.toml")
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        if let Err(e) = config.validate() {
            panic!("Invalid configuration: {e}");
        }
        config
    }

    /// Reject settings the tracking loop cannot run with. Every cadence and
    /// timeout is a divisor or a sleep, so zero would spin the loop.
    pub fn validate(&self) -> Result<(), String> {
        let t = &self.tracking;
        let positive = [
            ("tracking.interval_ms", t.interval_ms),
            ("tracking.status_poll_ms", t.status_poll_ms),
            ("tracking.lock_ttl_ms", t.lock_ttl_ms),
            ("tracking.min_sleep_ms", t.min_sleep_ms),
            ("tracking.error_backoff_ms", t.error_backoff_ms),
            ("tracking.sample_timeout_ms", t.sample_timeout_ms),
            ("backend.request_timeout_ms", self.backend.request_timeout_ms),
            ("connectivity.probe_timeout_ms", self.connectivity.probe_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(format!("{name} must be greater than zero"));
            }
        }
        if self.control.max_concurrent_requests == 0 {
            return Err("control.max_concurrent_requests must be greater than zero".into());
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RIDER_TRACKER_BACKEND_URL") {
            self.backend.base_url = url;
        }
        if let Ok(key) = std::env::var("RIDER_TRACKER_API_KEY") {
            self.control.api_key = key;
        }
        if let Ok(listen) = std::env::var("RIDER_TRACKER_LISTEN") {
            self.control.listen = listen;
        }
        if let Ok(dir) = std::env::var("RIDER_TRACKER_DATA_DIR") {
            self.store.data_dir = dir;
        }
    }
}
