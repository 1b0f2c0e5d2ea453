#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # rider-tracker
//!
//! Background GPS reporting daemon for delivery riders.
//!
//! While a rider token is stored and the backend's switch says `start`, the
//! daemon sends one fresh GNSS fix to the rider backend per interval. A
//! small authenticated HTTP API on `127.0.0.1:1338` lets the local UI start
//! and stop tracking.
//!
//! ## Subcommands
//!
//! - `rider-tracker serve` (default) — run the daemon
//! - `rider-tracker supervise` — run the daemon and restart it on crash
//! - `rider-tracker status --token <t>` — print the remote switch once
//!
//! ## Layout
//!
//! ```text
//! main.rs          — entry point, clap subcommands, wiring, graceful shutdown
//! supervisor.rs    — restart loop with backoff and signal forwarding
//! config.rs        — TOML + env-var configuration
//! service.rs       — start/stop/remote status facade
//! host.rs          — background task host
//! scheduler.rs     — the tracking loop
//! state.rs         — persisted auth / last sent / send lock
//! store.rs         — key-value store (JSON file, memory)
//! backend.rs       — rider API client
//! switch.rs        — remote directive parsing
//! reporter.rs      — location POST
//! sampler.rs       — one-shot fix with timeout
//! gps.rs, modem.rs — Quectel GNSS over AT commands
//! permission.rs    — location permission gate
//! connectivity.rs  — TCP reachability probe
//! routes/          — control API handlers
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use rider_tracker::config::Config;
use rider_tracker::connectivity::TcpProbe;
use rider_tracker::gps::ModemGps;
use rider_tracker::permission::{DeviceAccess, PermissionGate};
use rider_tracker::routes::{self, AppState};
use rider_tracker::sampler::Sampler;
use rider_tracker::scheduler::{SystemClock, TrackerDeps};
use rider_tracker::store::FileStore;
use rider_tracker::switch::DirectiveSource;
use rider_tracker::util::expand_tilde;
use rider_tracker::{supervisor, BackendClient, TrackingService};

/// Background GPS reporting daemon for delivery riders.
#[derive(Parser)]
#[command(name = "rider-tracker", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the daemon under a restart supervisor.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Poll the remote tracking switch once and print it.
    Status {
        /// Rider bearer token.
        #[arg(long)]
        token: String,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise { config }) => run_supervisor_mode(config.as_deref()).await,
        Some(Commands::Status { token, config }) => run_status(&token, config.as_deref()).await,
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ExitCode {
    let config = Config::load(config_path);
    init_tracing(&config);

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("Cannot resolve own executable path: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("rider-tracker supervisor starting");
    supervisor::run_supervisor(&exe, config_path, &config.supervisor).await;
    ExitCode::SUCCESS
}

async fn run_status(token: &str, config_path: Option<&str>) -> ExitCode {
    let config = Config::load(config_path);
    init_tracing(&config);

    let client = match BackendClient::new(&config.backend) {
        Ok(client) => client,
        Err(e) => {
            error!("Cannot build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };
    match client.fetch_directive(token).await {
        Ok(directive) => {
            println!("{}", directive.as_str());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Remote status poll failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config_path: Option<&str>) -> ExitCode {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("rider-tracker v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Backend: {}", config.backend.base_url);
    info!("Listening on {}", config.control.listen);

    if config.control.api_key == "change-me" {
        warn!("Using default control key, set RIDER_TRACKER_API_KEY or update config");
    }

    let data_dir = expand_tilde(&config.store.data_dir).into_owned();
    let store = match FileStore::open(Path::new(&data_dir)).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Cannot open tracking state in {data_dir}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("Tracking state: {}", store.path().display());

    let backend = match BackendClient::new(&config.backend) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Cannot build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let gps = Arc::new(ModemGps::new(config.gps.clone()));
    let deps = TrackerDeps {
        store,
        switch: backend.clone(),
        sampler: Sampler::new(
            gps.clone(),
            Duration::from_millis(config.tracking.sample_timeout_ms),
        ),
        reporter: backend.clone(),
        connectivity: Arc::new(TcpProbe::for_url(
            backend.base_url(),
            Duration::from_millis(config.connectivity.probe_timeout_ms),
        )),
        clock: Arc::new(SystemClock),
    };
    let gate = PermissionGate::new(Arc::new(DeviceAccess::new(&config.gps.device)));
    let service = Arc::new(TrackingService::new(deps, config.tracking.clone(), gate));

    // a second daemon on the same port exits here, before touching the session
    let listener = match TcpListener::bind(&config.control.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.control.listen);
            return ExitCode::FAILURE;
        }
    };

    match service.resume_if_authorized().await {
        Ok(true) => info!("Resumed tracking from stored session"),
        Ok(false) => info!("No stored session, waiting for a start request"),
        Err(e) => warn!("Could not resume tracking: {e}"),
    }

    let app = routes::router(AppState::new(Arc::new(config), service.clone()));
    info!("Control API ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down...");
    service.shutdown().await;
    gps.shutdown().await;

    if let Err(e) = served {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }
    info!("Goodbye");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Cannot register SIGTERM handler: {e}");
            let _ = ctrl_c.await;
            info!("Received SIGINT");
        }
    }
}
