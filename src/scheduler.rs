//! The tracking loop.
//!
//! One [`Scheduler`] runs one cooperative loop. Each wake cycle:
//!
//! 1. reads the stored auth token — none means the session is over;
//! 2. refreshes the remote [`Directive`] when the poll is due;
//! 3. if the directive is `Start` and the send is due: checks connectivity,
//!    takes the send lock, samples one fix, reports it, records the send
//!    time, and releases the lock on every path;
//! 4. sleeps until the next poll or send, never less than `min_sleep_ms`.
//!
//! Two conditions end the loop on their own: missing auth at the top of a
//! cycle and an HTTP 401 from the reporter. Both clear the persisted session
//! including the token. Every other failure is absorbed: a failed poll keeps
//! the last directive, a failed send leaves the send window unconsumed, and
//! an unexpected store error costs one `error_backoff_ms` sleep.
//!
//! Failed polls are not retried on every wake. The n-th consecutive failure
//! schedules the next poll `min(min_sleep_ms * 2^(n-1), status_poll_ms)`
//! later, so a dead backend is asked at most once per sleep floor at first
//! and then once per regular poll interval.
//!
//! A scheduler may be torn down and rebuilt at any moment. On entry it
//! starts from `Stop` and derives the next send time from the persisted
//! last-sent timestamp, so a restart never shortens the reporting interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TrackingConfig;
use crate::connectivity::Connectivity;
use crate::reporter::LocationReporter;
use crate::sampler::Sampler;
use crate::state::{StateKeys, TrackingState};
use crate::status::TrackerStatus;
use crate::store::{KvStore, StoreError};
use crate::switch::{Directive, DirectiveSource};
use crate::util::epoch_ms;

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        epoch_ms()
    }
}

/// Everything the loop talks to.
#[derive(Clone)]
pub struct TrackerDeps {
    pub store: Arc<dyn KvStore>,
    pub switch: Arc<dyn DirectiveSource>,
    pub sampler: Sampler,
    pub reporter: Arc<dyn LocationReporter>,
    pub connectivity: Arc<dyn Connectivity>,
    pub clock: Arc<dyn Clock>,
}

/// Cadence and bookkeeping for one loop instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    pub status_poll_ms: u64,
    pub lock_ttl_ms: u64,
    pub min_sleep_ms: u64,
    pub error_backoff_ms: u64,
    pub keys: StateKeys,
}

impl SchedulerConfig {
    /// Combine the `[tracking]` settings with the cadence of a start request.
    #[must_use]
    pub fn from_tracking(tracking: &TrackingConfig, interval_ms: u64, status_poll_ms: u64) -> Self {
        Self {
            interval_ms,
            status_poll_ms,
            lock_ttl_ms: tracking.lock_ttl_ms,
            min_sleep_ms: tracking.min_sleep_ms,
            error_backoff_ms: tracking.error_backoff_ms,
            keys: StateKeys::with_prefix(&tracking.key_prefix),
        }
    }
}

/// Why [`Scheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// `stop_tracking` (or host shutdown) cancelled the loop.
    Cancelled,
    /// No usable auth token at the top of a cycle.
    AuthMissing,
    /// The backend rejected the token with HTTP 401.
    Unauthorized,
}

impl LoopExit {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::AuthMissing => "auth_missing",
            Self::Unauthorized => "unauthorized",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("tracking state: {0}")]
    Store(#[from] StoreError),
}

enum Step {
    Sleep(Duration),
    Exit(LoopExit),
}

enum SendOutcome {
    Sent,
    Offline,
    Locked,
    NotDue,
    Failed,
    Unauthorized,
}

pub struct Scheduler {
    config: SchedulerConfig,
    deps: TrackerDeps,
    state: TrackingState,
    status: Arc<Mutex<TrackerStatus>>,
    directive: Directive,
    next_poll_at: u64,
    next_send_at: u64,
    poll_failures: u32,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        deps: TrackerDeps,
        status: Arc<Mutex<TrackerStatus>>,
    ) -> Self {
        let state = TrackingState::new(deps.store.clone(), config.keys.clone(), config.lock_ttl_ms);
        Self {
            config,
            deps,
            state,
            status,
            directive: Directive::Stop,
            next_poll_at: 0,
            next_send_at: 0,
            poll_failures: 0,
        }
    }

    /// Run until cancelled or until one of the authoritative stop conditions.
    pub async fn run(mut self, cancel: CancellationToken) -> LoopExit {
        self.status.lock().await.last_exit = None;
        let now = self.deps.clock.now_ms();
        self.next_send_at = match self.state.next_send_at(self.config.interval_ms, now).await {
            Ok(at) => at,
            Err(e) => {
                warn!("Tracker: cannot read last send time ({e}), allowing immediate send");
                now
            }
        };
        info!(
            "Tracker: loop started (interval {}ms, poll {}ms, lock owner {})",
            self.config.interval_ms,
            self.config.status_poll_ms,
            self.state.owner()
        );

        let exit = loop {
            if cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }
            let pause = match self.cycle().await {
                Ok(Step::Sleep(pause)) => pause,
                Ok(Step::Exit(reason)) => break reason,
                Err(e) => {
                    let backoff = Duration::from_millis(self.config.error_backoff_ms);
                    warn!("Tracker: cycle failed: {e}, retrying in {backoff:?}");
                    self.status.lock().await.last_error = Some(e.to_string());
                    backoff
                }
            };
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = cancel.cancelled() => break LoopExit::Cancelled,
            }
        };

        info!("Tracker: loop ended ({})", exit.as_str());
        self.status.lock().await.last_exit = Some(exit.as_str());
        exit
    }

    async fn cycle(&mut self) -> Result<Step, CycleError> {
        let Some(auth) = self.state.load_auth().await? else {
            info!("Tracker: no stored auth, stopping");
            self.end_session().await;
            return Ok(Step::Exit(LoopExit::AuthMissing));
        };

        let now = self.deps.clock.now_ms();

        if now >= self.next_poll_at {
            self.poll(&auth.token, now).await;
        }

        if self.directive.is_start() && now >= self.next_send_at {
            if let SendOutcome::Unauthorized = self.send(&auth.token, now).await? {
                warn!("Tracker: backend rejected the rider token (401), stopping");
                self.end_session().await;
                return Ok(Step::Exit(LoopExit::Unauthorized));
            }
        }

        let pause = self.next_pause(self.deps.clock.now_ms());
        {
            let mut status = self.status.lock().await;
            status.directive = self.directive;
            status.next_poll_at_ms = Some(self.next_poll_at);
            status.next_send_at_ms = self.directive.is_start().then_some(self.next_send_at);
        }
        Ok(Step::Sleep(pause))
    }

    async fn poll(&mut self, token: &str, now: u64) {
        match self.deps.switch.fetch_directive(token).await {
            Ok(directive) => {
                if directive != self.directive {
                    info!(
                        "Tracker: remote switch {} -> {}",
                        self.directive.as_str(),
                        directive.as_str()
                    );
                }
                self.directive = directive;
                self.poll_failures = 0;
                self.next_poll_at = now.saturating_add(self.config.status_poll_ms);
            }
            Err(e) => {
                self.poll_failures = self.poll_failures.saturating_add(1);
                let retry = self.poll_retry_delay();
                warn!(
                    "Tracker: switch poll failed ({} in a row): {e}, keeping {} and retrying in {retry}ms",
                    self.poll_failures,
                    self.directive.as_str()
                );
                self.next_poll_at = now.saturating_add(retry);
                self.status.lock().await.record_poll_failure(e.to_string());
            }
        }
    }

    /// Retry delay after consecutive poll failures: the sleep floor first,
    /// doubling per failure, never longer than the regular poll interval.
    fn poll_retry_delay(&self) -> u64 {
        let shift = self.poll_failures.saturating_sub(1).min(16);
        self.config
            .min_sleep_ms
            .saturating_mul(1u64 << shift)
            .min(self.config.status_poll_ms.max(self.config.min_sleep_ms))
    }

    async fn send(&mut self, token: &str, now: u64) -> Result<SendOutcome, CycleError> {
        if !self.deps.connectivity.is_online().await {
            debug!("Tracker: offline, deferring send by one interval");
            self.next_send_at = now.saturating_add(self.config.interval_ms);
            self.status.lock().await.sends_skipped_offline += 1;
            return Ok(SendOutcome::Offline);
        }

        if !self.state.try_acquire_lock(now).await? {
            debug!("Tracker: send lock busy, skipping this cycle");
            self.status.lock().await.sends_skipped_locked += 1;
            return Ok(SendOutcome::Locked);
        }

        let outcome = self.send_locked(token, now).await;
        if let Err(e) = self.state.release_lock().await {
            warn!("Tracker: failed to release send lock: {e}");
        }
        outcome
    }

    /// Sample and report while holding the lock.
    async fn send_locked(&mut self, token: &str, now: u64) -> Result<SendOutcome, CycleError> {
        // Another loop instance may have sent while we waited for the lock.
        let due = self.state.next_send_at(self.config.interval_ms, now).await?;
        if due > now {
            debug!("Tracker: a send already happened, next due at {due}");
            self.next_send_at = due;
            return Ok(SendOutcome::NotDue);
        }

        let fix = match self.deps.sampler.sample_once().await {
            Ok(fix) => fix,
            Err(e) => {
                warn!("Tracker: no location fix: {e}");
                self.status.lock().await.record_report_failure(e.to_string());
                return Ok(SendOutcome::Failed);
            }
        };

        match self.deps.reporter.report(token, &fix).await {
            Ok(()) => {
                let sent_at = self.deps.clock.now_ms();
                // The window is consumed even if persisting it fails below.
                self.next_send_at = sent_at.saturating_add(self.config.interval_ms);
                self.status.lock().await.record_report(sent_at);
                info!(
                    "Tracker: reported {:.6},{:.6}, next send at {}",
                    fix.latitude, fix.longitude, self.next_send_at
                );
                self.state.set_last_sent_ms(sent_at).await?;
                Ok(SendOutcome::Sent)
            }
            Err(e) if e.is_unauthorized() => Ok(SendOutcome::Unauthorized),
            Err(e) => {
                warn!("Tracker: report failed: {e}, will retry");
                self.status.lock().await.record_report_failure(e.to_string());
                Ok(SendOutcome::Failed)
            }
        }
    }

    fn next_pause(&self, now: u64) -> Duration {
        let wake = if self.directive.is_start() {
            self.next_poll_at.min(self.next_send_at)
        } else {
            self.next_poll_at
        };
        Duration::from_millis(wake.saturating_sub(now).max(self.config.min_sleep_ms))
    }

    /// Clear lock, last-sent and auth. Best effort: the loop is ending anyway.
    async fn end_session(&self) {
        if let Err(e) = self.state.clear_session(true).await {
            warn!("Tracker: failed to clear tracking state: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig::from_tracking(&TrackingConfig::default(), 60_000, 15_000)
    }

    async fn run_for(harness: &Harness, millis: u64) -> Vec<u64> {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(harness.scheduler(config()).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(millis)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
        harness.reporter.post_times()
    }

    #[tokio::test(start_paused = true)]
    async fn reports_on_interval_while_started() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Start);

        let posts = run_for(&harness, 130_000).await;

        assert_times(&posts, &[0, 60_000, 120_000]);
        let last = harness.state().last_sent_ms().await.unwrap().unwrap();
        assert_eq!(last, *posts.last().unwrap());
        for pair in posts.windows(2) {
            assert!(pair[1] - pair[0] >= 60_000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_directive_sends_nothing() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Stop);

        let posts = run_for(&harness, 100_000).await;

        assert!(posts.is_empty());
        assert_eq!(harness.provider.calls(), 0);
        // polled at 0, 15s, 30s ... 90s
        assert_eq!(harness.switch.calls(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_keeps_last_directive() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Start);
        harness.switch.script(vec![
            Ok(Directive::Start),
            Err(500),
            Ok(Directive::Start),
        ]);

        let posts = run_for(&harness, 70_000).await;

        assert_times(&posts, &[0, 60_000]);
        // the failed poll at 15s was retried one second later
        let polls = harness.switch.call_times();
        assert!((15_000..15_010).contains(&(polls[1] - BASE_MS)));
        assert!(polls[2] - polls[1] < 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_poll_failures_back_off() {
        let harness = Harness::new().await;
        harness.switch.script(vec![Err(503); 64]);

        run_for(&harness, 60_000).await;

        let polls = harness.switch.call_times();
        let gaps: Vec<u64> = polls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] < 1_100);
        assert!(gaps[1] >= 2_000);
        assert!(gaps.iter().all(|g| *g <= 15_100));
        assert!(polls.len() < 15);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_report_stops_and_clears_auth() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Start);
        harness.reporter.script(vec![200, 401]);

        let exit = harness
            .scheduler(config())
            .run(CancellationToken::new())
            .await;

        assert_eq!(exit, LoopExit::Unauthorized);
        assert_times(&harness.reporter.post_times(), &[0, 60_000]);
        let state = harness.state();
        assert!(state.load_auth().await.unwrap().is_none());
        assert!(state.last_sent_ms().await.unwrap().is_none());
        assert!(harness.store.get("FD_LOC_SEND_LOCK").await.unwrap().is_none());

        let polls = harness.switch.calls();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(harness.switch.calls(), polls);
        assert_eq!(harness.reporter.post_times().len(), 2);
        assert_eq!(harness.status.lock().await.last_exit, Some("unauthorized"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_auth_exits_before_any_call() {
        let harness = Harness::new().await;
        harness.state().clear_auth().await.unwrap();

        let exit = harness
            .scheduler(config())
            .run(CancellationToken::new())
            .await;

        assert_eq!(exit, LoopExit::AuthMissing);
        assert_eq!(harness.switch.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_removed_mid_run_stops_loop() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Stop);
        let task = tokio::spawn(harness.scheduler(config()).run(CancellationToken::new()));

        tokio::time::sleep(Duration::from_millis(20_000)).await;
        harness.state().clear_auth().await.unwrap();

        assert_eq!(task.await.unwrap(), LoopExit::AuthMissing);
        assert_eq!(harness.switch.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_report_does_not_consume_interval() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Start);
        harness.reporter.script(vec![200, 500]);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(harness.scheduler(config()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(60_500)).await;
        assert_eq!(harness.reporter.post_times().len(), 2);
        let last = harness.state().last_sent_ms().await.unwrap().unwrap();
        assert!(last - BASE_MS < 10);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        cancel.cancel();
        task.await.unwrap();

        let posts = harness.reporter.post_times();
        assert_eq!(posts.len(), 3);
        let last = harness.state().last_sent_ms().await.unwrap().unwrap();
        assert_eq!(last, posts[2]);
        assert!(posts[2] - posts[1] <= 1_100);
        assert_eq!(harness.status.lock().await.reports_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn location_failure_skips_report_and_releases_lock() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Start);
        harness.provider.fail_next(1);

        let posts = run_for(&harness, 1_500).await;

        assert_eq!(harness.provider.calls(), 2);
        assert_eq!(posts.len(), 1);
        assert!(posts[0] - BASE_MS >= 1_000);
        assert!(harness.store.get("FD_LOC_SEND_LOCK").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_defers_send_by_one_interval() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Start);
        harness.connectivity.script(vec![true, false, true]);

        let posts = run_for(&harness, 125_000).await;

        assert_times(&posts, &[0, 120_000]);
        assert_eq!(harness.provider.calls(), 2);
        assert_eq!(harness.status.lock().await.sends_skipped_offline, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_loops_post_once() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Start);
        harness.reporter.set_delay(Duration::from_secs(5));

        let cancel = CancellationToken::new();
        let a = tokio::spawn(harness.scheduler(config()).run(cancel.clone()));
        let b = tokio::spawn(harness.scheduler(config()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30_000)).await;
        cancel.cancel();
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(harness.reporter.post_times().len(), 1);
        assert_eq!(harness.provider.calls(), 1);
        assert!(harness.status.lock().await.sends_skipped_locked >= 1);
        assert_eq!(harness.status.lock().await.reports_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_respects_persisted_last_send() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Start);
        harness
            .state()
            .set_last_sent_ms(BASE_MS - 20_000)
            .await
            .unwrap();

        let posts = run_for(&harness, 45_000).await;

        assert_times(&posts, &[40_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn store_error_backs_off_and_continues() {
        let harness = Harness::with_flaky_store(2, 0).await;
        harness.switch.always(Directive::Start);

        let posts = run_for(&harness, 3_000).await;

        assert_times(&posts, &[2_000]);
        assert!(harness.status.lock().await.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unpersisted_send_still_consumes_interval() {
        // the lock CAS does not go through `set`, so the first failing write
        // is the last-sent timestamp
        let harness = Harness::with_flaky_store(0, 1).await;
        harness.switch.always(Directive::Start);

        let posts = run_for(&harness, 30_000).await;

        assert_times(&posts, &[0]);
        let status = harness.status.lock().await;
        assert_eq!(status.reports_sent, 1);
        assert!(status.last_error.as_deref().unwrap().contains("scripted write"));
        drop(status);
        assert!(harness.store.get("FD_LOC_SEND_LOCK").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep() {
        let harness = Harness::new().await;
        harness.switch.always(Directive::Stop);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(harness.scheduler(config()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = tokio::time::Instant::now();
        cancel.cancel();
        assert_eq!(task.await.unwrap(), LoopExit::Cancelled);
        assert!(before.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn pause_has_floor_and_ignores_send_when_stopped() {
        let deps = Harness::blocking_deps();
        let status = Arc::new(Mutex::new(TrackerStatus::new()));
        let mut scheduler = Scheduler::new(config(), deps, status);
        scheduler.next_poll_at = 10_000;
        scheduler.next_send_at = 2_000;

        assert_eq!(scheduler.next_pause(0), Duration::from_millis(10_000));
        scheduler.directive = Directive::Start;
        assert_eq!(scheduler.next_pause(0), Duration::from_millis(2_000));
        assert_eq!(scheduler.next_pause(1_900), Duration::from_millis(1_000));
        assert_eq!(scheduler.next_pause(50_000), Duration::from_millis(1_000));
    }

    #[test]
    fn poll_retry_delay_is_bounded() {
        let deps = Harness::blocking_deps();
        let status = Arc::new(Mutex::new(TrackerStatus::new()));
        let mut scheduler = Scheduler::new(config(), deps, status);
        let mut delays = Vec::new();
        for failures in 1..=8 {
            scheduler.poll_failures = failures;
            delays.push(scheduler.poll_retry_delay());
        }
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 15_000, 15_000, 15_000, 15_000]
        );
    }
}
