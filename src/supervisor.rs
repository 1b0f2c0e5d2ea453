//! Restart supervisor.
//!
//! `rider-tracker supervise` runs `rider-tracker serve` as a child and
//! restarts it with exponential backoff whenever it exits abnormally. A clean
//! exit (code 0) ends supervision. SIGINT and SIGTERM are forwarded to the
//! child so it can stop the tracking loop and release the modem.
//!
//! Nothing is handed over between generations: the new daemon rebuilds its
//! tracking state from the state file and resumes if a rider token is
//! stored.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

/// Backoff after a child that ran for `uptime`.
fn next_backoff(current: u64, uptime: Duration, config: &SupervisorConfig) -> u64 {
    if uptime >= Duration::from_secs(config.stable_threshold) {
        1
    } else {
        current.saturating_mul(2).min(config.max_backoff.max(1))
    }
}

fn forward_signals(pid: Option<u32>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            warn!("Supervisor: cannot register signal handlers, not forwarding");
            return;
        };
        let (name, signo) = tokio::select! {
            _ = sigint.recv() => ("SIGINT", libc::SIGINT),
            _ = sigterm.recv() => ("SIGTERM", libc::SIGTERM),
        };
        info!("Supervisor: forwarding {name} to child");
        if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
            // SAFETY: kill(2) has no memory-safety preconditions
            unsafe {
                libc::kill(pid, signo);
            }
        }
    })
}

/// Supervise `exe serve [--config path]` until it exits cleanly.
pub async fn run_supervisor(exe: &Path, config_path: Option<&str>, config: &SupervisorConfig) {
    let mut backoff = 1u64;

    loop {
        let started = Instant::now();

        let mut cmd = Command::new(exe);
        cmd.arg("serve");
        if let Some(p) = config_path {
            cmd.args(["--config", p]);
        }

        let status = match cmd.spawn() {
            Ok(mut child) => {
                let pid = child.id();
                info!("Supervisor: started tracker (pid {pid:?})");
                let forwarder = forward_signals(pid);
                let status = child.wait().await;
                forwarder.abort();
                status
            }
            Err(e) => Err(e),
        };
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() => {
                info!("Tracker exited cleanly, supervisor stopping");
                return;
            }
            Ok(s) => warn!(
                "Tracker exited: {s} (uptime {:.1}s), restarting in {backoff}s",
                uptime.as_secs_f64()
            ),
            Err(e) => error!(
                "Tracker spawn/wait error: {e} (uptime {:.1}s), restarting in {backoff}s",
                uptime.as_secs_f64()
            ),
        }

        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = next_backoff(backoff, uptime, config);
    }
}
