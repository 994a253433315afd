//! Lock store contract and the in-memory implementation.
//!
//! Any key-value store that offers atomic conditional writes with expiry
//! (Redis `SET NX PX` plus a compare-and-delete script, etcd leases,
//! a SQL row with optimistic versioning) can implement `LockStore`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::StoreError;

/// Atomic conditional writes against an external key-value store.
///
/// A key is "held" while an unexpired value is stored under it. All three
/// operations must be atomic with respect to each other for the same key.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `value` under `key` with the given TTL, only if no unexpired
    /// value exists. Returns `true` when the value was written.
    async fn cas_set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Reset the TTL of `key` to `new_ttl`, only if the stored value equals
    /// `expected` and has not expired.
    async fn cas_extend(
        &self,
        key: &str,
        expected: &str,
        new_ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete `key`, only if the stored value equals `expected` and has not
    /// expired.
    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}

/// About thirty years; stands in for "never" when a TTL overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + ttl`, saturating at a far-future instant instead of panicking.
pub fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process lock store.
///
/// Expiry uses the tokio clock so paused-time tests can advance past a TTL
/// without sleeping. Share one instance (behind an `Arc`) between several
/// scheduler instances to model replicas coordinating through one store.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, if the key is held.
    pub fn owner(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Remaining lifetime of `key`, if the key is held.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether no key is currently held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn cas_set(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline_after(now, ttl),
            },
        );
        Ok(true)
    }

    async fn cas_extend(
        &self,
        key: &str,
        expected: &str,
        new_ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entry.expires_at = deadline_after(now, new_ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            Some(entry) if !entry.is_live(now) => {
                entries.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}
