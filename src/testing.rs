//! Scripted collaborators for scheduler, service and route tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::BackendError;
use crate::connectivity::Connectivity;
use crate::permission::{Permission, PermissionStatus, PermissionSystem};
use crate::reporter::LocationReporter;
use crate::sampler::{GpsFix, LocationError, LocationProvider, PositionRequest, Sampler};
use crate::scheduler::{Clock, Scheduler, SchedulerConfig, TrackerDeps};
use crate::state::{StateKeys, TrackingState};
use crate::status::TrackerStatus;
use crate::store::{KvStore, MemoryStore, StoreError};
use crate::switch::{Directive, DirectiveSource};

/// Epoch milliseconds at test start.
pub(crate) const BASE_MS: u64 = 1_700_000_000_000;

pub(crate) const TOKEN: &str = "rider-token";

/// Follows tokio's (pausable) clock from `BASE_MS`.
pub(crate) struct TestClock {
    start: tokio::time::Instant,
}

impl TestClock {
    pub(crate) fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        BASE_MS + self.start.elapsed().as_millis() as u64
    }
}

/// Assert `times` land on `BASE_MS + offsets`, give or take timer rounding.
pub(crate) fn assert_times(times: &[u64], offsets: &[u64]) {
    let relative: Vec<u64> = times.iter().map(|t| t - BASE_MS).collect();
    assert_eq!(relative.len(), offsets.len(), "got {relative:?}, want {offsets:?}");
    for (got, want) in relative.iter().zip(offsets) {
        assert!(
            *got >= *want && *got - *want < 10,
            "got {relative:?}, want {offsets:?}"
        );
    }
}

fn status_error(status: u16) -> BackendError {
    BackendError::Status {
        status,
        message: format!("scripted {status}"),
    }
}

// ── Switch ──

pub(crate) struct FakeSwitch {
    clock: Arc<TestClock>,
    fallback: StdMutex<Directive>,
    script: StdMutex<VecDeque<Result<Directive, u16>>>,
    calls: StdMutex<Vec<u64>>,
}

impl FakeSwitch {
    /// Answer `directive` whenever the script is empty.
    pub(crate) fn always(&self, directive: Directive) {
        *self.fallback.lock().unwrap() = directive;
    }

    /// Answers for the next polls, `Err(status)` for an HTTP failure.
    pub(crate) fn script(&self, answers: Vec<Result<Directive, u16>>) {
        self.script.lock().unwrap().extend(answers);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn call_times(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DirectiveSource for FakeSwitch {
    async fn fetch_directive(&self, _token: &str) -> Result<Directive, BackendError> {
        self.calls.lock().unwrap().push(self.clock.now_ms());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(directive)) => Ok(directive),
            Some(Err(status)) => Err(status_error(status)),
            None => Ok(*self.fallback.lock().unwrap()),
        }
    }
}

// ── Location ──

pub(crate) struct FakeProvider {
    clock: Arc<TestClock>,
    calls: AtomicU32,
    failures: AtomicU32,
}

impl FakeProvider {
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` requests with "unavailable".
    pub(crate) fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocationProvider for FakeProvider {
    async fn current_position(&self, _request: PositionRequest) -> Result<GpsFix, LocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LocationError::Unavailable("scripted".into()));
        }
        Ok(GpsFix {
            latitude: 45.5017,
            longitude: -73.5673,
            captured_at_ms: self.clock.now_ms(),
            altitude: None,
            hdop: Some(0.8),
            satellites: Some(9),
        })
    }
}

// ── Reporter ──

pub(crate) struct FakeReporter {
    clock: Arc<TestClock>,
    script: StdMutex<VecDeque<u16>>,
    delay: StdMutex<Duration>,
    posts: StdMutex<Vec<u64>>,
}

impl FakeReporter {
    /// HTTP statuses for the next reports; 200 once the script runs out.
    pub(crate) fn script(&self, statuses: Vec<u16>) {
        self.script.lock().unwrap().extend(statuses);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// When each POST started, successful or not.
    pub(crate) fn post_times(&self) -> Vec<u64> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocationReporter for FakeReporter {
    async fn report(&self, _token: &str, _fix: &GpsFix) -> Result<(), BackendError> {
        self.posts.lock().unwrap().push(self.clock.now_ms());
        let status = self.script.lock().unwrap().pop_front().unwrap_or(200);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(status_error(status))
        }
    }
}

// ── Connectivity ──

#[derive(Default)]
pub(crate) struct FakeConnectivity {
    script: StdMutex<VecDeque<bool>>,
}

impl FakeConnectivity {
    /// Answers for the next checks; online once the script runs out.
    pub(crate) fn script(&self, answers: Vec<bool>) {
        self.script.lock().unwrap().extend(answers);
    }
}

#[async_trait]
impl Connectivity for FakeConnectivity {
    async fn is_online(&self) -> bool {
        self.script.lock().unwrap().pop_front().unwrap_or(true)
    }
}

// ── Permission ──

pub(crate) struct FakePermission {
    pub(crate) status: StdMutex<PermissionStatus>,
    pub(crate) calls: AtomicU32,
}

impl FakePermission {
    pub(crate) fn new(status: PermissionStatus) -> Self {
        Self {
            status: StdMutex::new(status),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PermissionSystem for FakePermission {
    async fn request(&self, _permission: Permission) -> PermissionStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.status.lock().unwrap()
    }
}

// ── Store ──

/// Memory store whose next `failing_reads` gets and `failing_writes` sets fail.
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
}

fn take_failure(counter: &AtomicU32, what: &str) -> Result<(), StoreError> {
    let failing = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return Err(StoreError::Io(std::io::Error::other(format!(
            "scripted {what} failure"
        ))));
    }
    Ok(())
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        take_failure(&self.failing_reads, "read")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        take_failure(&self.failing_writes, "write")?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.inner.remove_many(keys).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.inner.compare_and_swap(key, expected, new).await
    }
}

// ── Harness ──

pub(crate) struct Harness {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) clock: Arc<TestClock>,
    pub(crate) switch: Arc<FakeSwitch>,
    pub(crate) provider: Arc<FakeProvider>,
    pub(crate) reporter: Arc<FakeReporter>,
    pub(crate) connectivity: Arc<FakeConnectivity>,
    pub(crate) status: Arc<Mutex<TrackerStatus>>,
}

impl Harness {
    /// Fakes over a memory store that already holds [`TOKEN`].
    pub(crate) async fn new() -> Self {
        let harness = Self::over(Arc::new(MemoryStore::new()));
        harness.state().save_auth(TOKEN).await.unwrap();
        harness
    }

    /// Like [`Harness::new`], then the next `failing_reads` gets and
    /// `failing_writes` sets fail.
    pub(crate) async fn with_flaky_store(failing_reads: u32, failing_writes: u32) -> Self {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing_reads: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
        });
        let harness = Self::over(store.clone());
        harness.state().save_auth(TOKEN).await.unwrap();
        store.failing_reads.store(failing_reads, Ordering::SeqCst);
        store.failing_writes.store(failing_writes, Ordering::SeqCst);
        harness
    }

    pub(crate) fn over(store: Arc<dyn KvStore>) -> Self {
        let clock = Arc::new(TestClock::new());
        Self {
            store,
            switch: Arc::new(FakeSwitch {
                clock: clock.clone(),
                fallback: StdMutex::new(Directive::Stop),
                script: StdMutex::new(VecDeque::new()),
                calls: StdMutex::new(Vec::new()),
            }),
            provider: Arc::new(FakeProvider {
                clock: clock.clone(),
                calls: AtomicU32::new(0),
                failures: AtomicU32::new(0),
            }),
            reporter: Arc::new(FakeReporter {
                clock: clock.clone(),
                script: StdMutex::new(VecDeque::new()),
                delay: StdMutex::new(Duration::ZERO),
                posts: StdMutex::new(Vec::new()),
            }),
            connectivity: Arc::new(FakeConnectivity::default()),
            status: Arc::new(Mutex::new(TrackerStatus::new())),
            clock,
        }
    }

    /// Deps for tests that never run the loop.
    pub(crate) fn blocking_deps() -> TrackerDeps {
        Self::over(Arc::new(MemoryStore::new())).deps()
    }

    pub(crate) fn deps(&self) -> TrackerDeps {
        TrackerDeps {
            store: self.store.clone(),
            switch: self.switch.clone(),
            sampler: Sampler::new(self.provider.clone(), Duration::from_secs(20)),
            reporter: self.reporter.clone(),
            connectivity: self.connectivity.clone(),
            clock: self.clock.clone(),
        }
    }

    pub(crate) fn state(&self) -> TrackingState {
        TrackingState::new(self.store.clone(), StateKeys::default(), 30_000)
    }

    pub(crate) fn scheduler(&self, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(config, self.deps(), self.status.clone())
    }
}
