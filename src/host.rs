//! Background task host.
//!
//! Owns at most one named long-running task. [`TaskHost::start`] is a no-op
//! while a task is alive; [`TaskHost::stop`] cancels it through its
//! [`CancellationToken`] and waits for it to return. A GPS or HTTP call
//! already in flight finishes (or times out) first, and the host stays locked
//! until then, so a start racing a stop never overlaps two tasks.

use std::future::Future;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::scheduler::LoopExit;
use crate::util::epoch_ms;

pub const TASK_NAME: &str = "RiderTrackingWatcher";
pub const TASK_TITLE: &str = "Rider tracking service";
pub const TASK_DESCRIPTION: &str = "Listening for tracking start/stop";

/// Identity and parameters a task was started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOptions {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub interval_ms: u64,
    pub status_poll_ms: u64,
}

impl TaskOptions {
    /// Options for the rider tracking task.
    #[must_use]
    pub fn tracking(interval_ms: u64, status_poll_ms: u64) -> Self {
        Self {
            name: TASK_NAME,
            title: TASK_TITLE,
            description: TASK_DESCRIPTION,
            interval_ms,
            status_poll_ms,
        }
    }
}

/// What a running task looks like from the outside.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    #[serde(flatten)]
    pub options: TaskOptions,
    pub started_at_ms: u64,
}

struct RunningTask {
    info: TaskInfo,
    cancel: CancellationToken,
    handle: JoinHandle<LoopExit>,
}

#[derive(Default)]
pub struct TaskHost {
    running: Mutex<Option<RunningTask>>,
}

impl TaskHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` unless one is already alive. Returns whether it spawned.
    pub async fn start<F, Fut>(&self, options: TaskOptions, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = LoopExit> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                info!("Host: {} already running", current.info.options.name);
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        info!(
            "Host: started {} ({}: {})",
            options.name, options.title, options.description
        );
        *running = Some(RunningTask {
            info: TaskInfo {
                options,
                started_at_ms: epoch_ms(),
            },
            cancel,
            handle,
        });
        true
    }

    /// Cancel the task, if any, and wait for it to finish. Returns whether a
    /// live task was stopped.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(task) = running.take() else {
            return false;
        };
        let was_alive = !task.handle.is_finished();
        task.cancel.cancel();
        if was_alive {
            info!("Host: stopping {}", task.info.options.name);
        }
        match task.handle.await {
            Ok(exit) => info!("Host: {} ended ({})", task.info.options.name, exit.as_str()),
            Err(e) => warn!("Host: {} did not end cleanly: {e}", task.info.options.name),
        }
        drop(running);
        was_alive
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// The live task's info, `None` when nothing is running.
    pub async fn current(&self) -> Option<TaskInfo> {
        self.running
            .lock()
            .await
            .as_ref()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.info.clone())
    }

    /// Cancel and wait for the task to finish. Used on daemon shutdown.
    pub async fn shutdown(&self) -> Option<LoopExit> {
        let task = self.running.lock().await.take()?;
        task.cancel.cancel();
        task.handle.await.ok()
    }
}
