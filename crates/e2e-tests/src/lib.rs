//! End-to-end test infrastructure for the fleet scheduler.
//!
//! Provides a shared TestHarness that stands up several scheduler replicas
//! over one lock store, plus handlers and a store that record what happened.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use fleet_lock::{LockStore, MemoryLockStore, StoreError};
use fleet_scheduler::{
    HandlerError, JobContext, JobHandler, MonitorEvent, SchedulerConfig, SchedulerService,
};

/// Scheduler settings with short grace periods.
pub fn fast_config(instance_id: &str) -> SchedulerConfig {
    SchedulerConfig {
        instance_id: instance_id.to_string(),
        shutdown_timeout_secs: 2,
        cancel_grace_ms: 50,
        max_idle_secs: 1,
        ..Default::default()
    }
}

/// Shared test harness: `n` replicas over one flaky store.
pub struct TestHarness {
    pub store: Arc<FlakyStore>,
    pub replicas: Vec<SchedulerService>,
}

impl TestHarness {
    /// Create replicas named `replica-0` .. `replica-{n-1}`.
    pub fn new(replicas: usize) -> Self {
        let store = Arc::new(FlakyStore::new());
        let replicas = (0..replicas)
            .map(|i| {
                SchedulerService::new(fast_config(&format!("replica-{}", i)), store.clone())
                    .expect("Failed to create scheduler")
            })
            .collect();
        Self { store, replicas }
    }

    pub fn replica(&self, index: usize) -> &SchedulerService {
        &self.replicas[index]
    }

    pub async fn start_all(&self) {
        for replica in &self.replicas {
            replica.start().await.expect("Failed to start scheduler");
        }
    }

    pub async fn shutdown_all(&self) {
        for replica in &self.replicas {
            if replica.is_running() {
                replica.shutdown().await.expect("Failed to shut down scheduler");
            }
        }
    }
}

/// Lock store that can be switched into an outage.
///
/// While down, every operation fails with `StoreError::Unavailable`.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryLockStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// The backing store, for inspecting held leases.
    pub fn inner(&self) -> &MemoryLockStore {
        &self.inner
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for FlakyStore {
    async fn cas_set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.cas_set(key, value, ttl).await
    }

    async fn cas_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.cas_extend(key, expected, ttl).await
    }

    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.cas_delete(key, expected).await
    }
}

/// Counts runs and the peak number of handlers active at once.
///
/// One probe can back handlers on every replica, which makes it the
/// observer for fleet-wide exclusion.
#[derive(Debug, Default)]
pub struct OverlapProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

impl OverlapProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handler that holds its slot for `hold`, recording into a probe.
///
/// Returns early with a retryable error if cancelled.
pub struct HoldingHandler {
    probe: Arc<OverlapProbe>,
    hold: Duration,
}

impl HoldingHandler {
    pub fn new(probe: Arc<OverlapProbe>, hold: Duration) -> Self {
        Self { probe, hold }
    }
}

#[async_trait]
impl JobHandler for HoldingHandler {
    async fn execute(&self, ctx: JobContext) -> Result<(), HandlerError> {
        self.probe.enter();
        let result = tokio::select! {
            _ = tokio::time::sleep(self.hold) => Ok(()),
            _ = ctx.cancelled() => Err(HandlerError::retryable("cancelled")),
        };
        self.probe.exit();
        result
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Terminal events of `job_name`, in emission order.
pub fn terminal_events<'a>(
    events: &'a [MonitorEvent],
    job_name: &'a str,
) -> impl Iterator<Item = &'a MonitorEvent> + 'a {
    events
        .iter()
        .filter(move |e| e.terminal && e.job_name == job_name)
}

/// Poll `condition` every 10ms until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
