//! Per-job local concurrency limit.
//!
//! Each job owns a counting semaphore with `max_concurrency` permits. When
//! every permit is taken, the job's overlap policy decides whether a new
//! firing is skipped or waits in a bounded queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::SkipReason;

/// Policy for a firing that finds every slot of its job taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Skip the firing (recommended).
    ///
    /// Keeps a slow job from piling up behind itself when it runs longer
    /// than its schedule period. The skip is recorded like any other outcome.
    #[default]
    Skip,

    /// Wait for a slot, with at most `max_depth` firings waiting at once.
    /// Firings beyond the bound are skipped.
    Queue { max_depth: usize },
}

/// Why the limiter refused a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDenied {
    /// Every slot is in use and the policy is `Skip`
    Busy,
    /// Every slot is in use and the wait queue is at its bound
    QueueFull,
    /// Cancelled while waiting
    ShuttingDown,
}

impl From<SlotDenied> for SkipReason {
    fn from(denied: SlotDenied) -> Self {
        match denied {
            SlotDenied::Busy => SkipReason::ConcurrencyLimit,
            SlotDenied::QueueFull => SkipReason::QueueFull,
            SlotDenied::ShuttingDown => SkipReason::ShuttingDown,
        }
    }
}

struct JobSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiting: AtomicUsize,
}

impl JobSlots {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            waiting: AtomicUsize::new(0),
        }
    }

    fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }
}

/// Decrements the waiter count however the wait ends.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A held concurrency slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    job_name: String,
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Free the slot now.
    pub fn release(self) {
        drop(self);
    }
}

/// Per-job semaphores, created lazily on first use.
///
/// The map lock is held only to look up or insert a job's slots, never
/// while waiting for a permit.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    jobs: Mutex<HashMap<String, Arc<JobSlots>>>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure `job_name` with `max_concurrency` slots.
    ///
    /// A changed capacity installs a fresh semaphore; permits held on the
    /// old one are still released normally when their firings end.
    pub fn configure(&self, job_name: &str, max_concurrency: usize) {
        let mut jobs = self.jobs.lock();
        let capacity = max_concurrency.max(1);
        match jobs.get(job_name) {
            Some(slots) if slots.capacity == capacity => {}
            _ => {
                jobs.insert(job_name.to_string(), Arc::new(JobSlots::new(capacity)));
            }
        }
    }

    /// Forget `job_name`. Held permits stay valid until dropped.
    pub fn remove(&self, job_name: &str) {
        self.jobs.lock().remove(job_name);
    }

    fn slots(&self, job_name: &str, max_concurrency: usize) -> Arc<JobSlots> {
        let capacity = max_concurrency.max(1);
        let mut jobs = self.jobs.lock();
        let slots = jobs
            .entry(job_name.to_string())
            .or_insert_with(|| Arc::new(JobSlots::new(capacity)));
        slots.clone()
    }

    /// Take a slot for `job_name` according to `policy`.
    ///
    /// Unknown jobs are configured with `max_concurrency` slots on the fly.
    pub async fn acquire(
        &self,
        job_name: &str,
        max_concurrency: usize,
        policy: OverlapPolicy,
        cancel: &CancellationToken,
    ) -> Result<Permit, SlotDenied> {
        if cancel.is_cancelled() {
            return Err(SlotDenied::ShuttingDown);
        }

        let slots = self.slots(job_name, max_concurrency);
        let permit = match slots.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(SlotDenied::ShuttingDown),
            Err(TryAcquireError::NoPermits) => match policy {
                OverlapPolicy::Skip => return Err(SlotDenied::Busy),
                OverlapPolicy::Queue { max_depth } => {
                    let queued = slots.waiting.fetch_add(1, Ordering::SeqCst);
                    let _waiting = WaitingGuard(&slots.waiting);
                    if queued >= max_depth {
                        return Err(SlotDenied::QueueFull);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SlotDenied::ShuttingDown),
                        permit = slots.semaphore.clone().acquire_owned() => {
                            permit.map_err(|_| SlotDenied::ShuttingDown)?
                        }
                    }
                }
            },
        };

        Ok(Permit {
            job_name: job_name.to_string(),
            _permit: permit,
        })
    }

    /// Slots currently held for `job_name`.
    pub fn in_flight(&self, job_name: &str) -> usize {
        self.jobs
            .lock()
            .get(job_name)
            .map(|slots| slots.in_flight())
            .unwrap_or(0)
    }

    /// Firings currently queued for a slot of `job_name`.
    pub fn waiting(&self, job_name: &str) -> usize {
        self.jobs
            .lock()
            .get(job_name)
            .map(|slots| slots.waiting.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Slots held across all jobs.
    pub fn total_in_flight(&self) -> usize {
        self.jobs.lock().values().map(|slots| slots.in_flight()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_skip_policy_reports_busy() {
        let limiter = ConcurrencyLimiter::new();
        let cancel = CancellationToken::new();

        let first = limiter
            .acquire("export", 1, OverlapPolicy::Skip, &cancel)
            .await
            .unwrap();
        assert_eq!(first.job_name(), "export");
        assert_eq!(limiter.in_flight("export"), 1);

        let second = limiter
            .acquire("export", 1, OverlapPolicy::Skip, &cancel)
            .await;
        assert_eq!(second.unwrap_err(), SlotDenied::Busy);

        first.release();
        assert_eq!(limiter.in_flight("export"), 0);
        assert!(limiter
            .acquire("export", 1, OverlapPolicy::Skip, &cancel)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_permits_never_exceed_capacity() {
        let limiter = ConcurrencyLimiter::new();
        let cancel = CancellationToken::new();
        limiter.configure("resize", 3);

        let mut held = Vec::new();
        for _ in 0..5 {
            if let Ok(permit) = limiter
                .acquire("resize", 3, OverlapPolicy::Skip, &cancel)
                .await
            {
                held.push(permit);
            }
        }
        assert_eq!(held.len(), 3);
        assert_eq!(limiter.in_flight("resize"), 3);
        assert_eq!(limiter.total_in_flight(), 3);
    }

    #[tokio::test]
    async fn test_jobs_are_independent() {
        let limiter = ConcurrencyLimiter::new();
        let cancel = CancellationToken::new();

        let _a = limiter
            .acquire("a", 1, OverlapPolicy::Skip, &cancel)
            .await
            .unwrap();
        assert!(limiter
            .acquire("b", 1, OverlapPolicy::Skip, &cancel)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_queue_waits_for_release() {
        let limiter = Arc::new(ConcurrencyLimiter::new());
        let cancel = CancellationToken::new();
        let policy = OverlapPolicy::Queue { max_depth: 1 };

        let held = limiter.acquire("sync", 1, policy, &cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("sync", 1, policy, &cancel).await.is_ok() })
        };

        while limiter.waiting("sync") == 0 {
            tokio::task::yield_now().await;
        }

        // Queue at its bound of one
        let overflow = limiter.acquire("sync", 1, policy, &cancel).await;
        assert_eq!(overflow.unwrap_err(), SlotDenied::QueueFull);

        drop(held);
        assert!(waiter.await.unwrap());
        assert_eq!(limiter.waiting("sync"), 0);
    }

    #[tokio::test]
    async fn test_queue_wait_aborts_on_cancel() {
        let limiter = Arc::new(ConcurrencyLimiter::new());
        let cancel = CancellationToken::new();
        let policy = OverlapPolicy::Queue { max_depth: 4 };

        let _held = limiter.acquire("sync", 1, policy, &cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("sync", 1, policy, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap().unwrap_err(), SlotDenied::ShuttingDown);
        assert_eq!(limiter.waiting("sync"), 0);
    }

    #[tokio::test]
    async fn test_reconfigure_capacity() {
        let limiter = ConcurrencyLimiter::new();
        let cancel = CancellationToken::new();
        limiter.configure("batch", 1);
        let _one = limiter
            .acquire("batch", 1, OverlapPolicy::Skip, &cancel)
            .await
            .unwrap();

        limiter.configure("batch", 2);
        assert_eq!(limiter.in_flight("batch"), 0);
        assert!(limiter
            .acquire("batch", 2, OverlapPolicy::Skip, &cancel)
            .await
            .is_ok());

        limiter.remove("batch");
        assert_eq!(limiter.in_flight("batch"), 0);
    }

    #[test]
    fn test_slot_denied_maps_to_skip_reason() {
        assert_eq!(SkipReason::from(SlotDenied::Busy), SkipReason::ConcurrencyLimit);
        assert_eq!(SkipReason::from(SlotDenied::QueueFull), SkipReason::QueueFull);
        assert_eq!(
            SkipReason::from(SlotDenied::ShuttingDown),
            SkipReason::ShuttingDown
        );
    }

    #[test]
    fn test_overlap_policy_serialization() {
        let json = serde_json::to_string(&OverlapPolicy::Skip).unwrap();
        assert_eq!(json, r#""skip""#);
        let json = serde_json::to_string(&OverlapPolicy::Queue { max_depth: 2 }).unwrap();
        assert_eq!(json, r#"{"queue":{"max_depth":2}}"#);
    }
}
