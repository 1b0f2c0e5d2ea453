//! In-memory tracker statistics, shared between the scheduler and the
//! control API. Nothing here is persisted; a restart resets the counters.

use serde::Serialize;

use crate::switch::Directive;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStatus {
    /// Last directive the scheduler acted on.
    pub directive: Directive,
    pub reports_sent: u64,
    pub reports_failed: u64,
    pub polls_failed: u64,
    /// Sends skipped because another holder had the lock.
    pub sends_skipped_locked: u64,
    /// Sends deferred because the device was offline.
    pub sends_skipped_offline: u64,
    pub last_report_at_ms: Option<u64>,
    pub next_send_at_ms: Option<u64>,
    pub next_poll_at_ms: Option<u64>,
    pub last_error: Option<String>,
    /// Why the last loop ended (`auth_missing`, `unauthorized`, `cancelled`).
    pub last_exit: Option<&'static str>,
}

impl TrackerStatus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_report(&mut self, sent_at_ms: u64) {
        self.reports_sent += 1;
        self.last_report_at_ms = Some(sent_at_ms);
    }

    pub(crate) fn record_report_failure(&mut self, msg: String) {
        self.reports_failed += 1;
        self.last_error = Some(msg);
    }

    pub(crate) fn record_poll_failure(&mut self, msg: String) {
        self.polls_failed += 1;
        self.last_error = Some(msg);
    }
}
