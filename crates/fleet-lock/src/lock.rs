//! Lease client with owner-token fencing.
//!
//! A lease is created by an atomic set-if-absent with TTL. Renewal and
//! release are conditioned on the owner token, so a holder that was
//! preempted (paused process, expired TTL) can neither extend nor delete a
//! lease that now belongs to someone else.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{deadline_after, LockStore, StoreError};

/// Ownership of one store key, held until released or expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    resource_key: String,
    owner_token: String,
    expires_at: Instant,
}

impl LockLease {
    /// Key this lease holds.
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Token written to the store; unique per acquisition.
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// Local, conservative estimate of when the store expires the key.
    ///
    /// Measured from before the store call was issued, so it never runs
    /// past the store's own expiry.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left on the lease according to the local estimate.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Whether the local estimate says the lease has lapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Lease client over a shared `LockStore`.
///
/// Cheap to clone; all clones share the store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    owner_id: String,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Create a client. `owner_id` identifies this process in owner tokens.
    pub fn new(store: Arc<dyn LockStore>, owner_id: impl Into<String>) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
        }
    }

    /// Identifier embedded in every owner token issued by this client.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn new_token(&self) -> String {
        format!("{}:{}", self.owner_id, Uuid::new_v4())
    }

    /// Try to take `resource_key` for `ttl`.
    ///
    /// Returns `Ok(None)` when another unexpired lease holds the key and
    /// surfaces store failures to the caller.
    pub async fn acquire(
        &self,
        resource_key: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, StoreError> {
        let token = self.new_token();
        let issued_at = Instant::now();

        if self.store.cas_set(resource_key, &token, ttl).await? {
            debug!(key = %resource_key, owner = %token, ttl_ms = ttl.as_millis() as u64, "Lease acquired");
            Ok(Some(LockLease {
                resource_key: resource_key.to_string(),
                owner_token: token,
                expires_at: deadline_after(issued_at, ttl),
            }))
        } else {
            debug!(key = %resource_key, "Lease held elsewhere");
            Ok(None)
        }
    }

    /// Try each key in order and return the first lease obtained.
    ///
    /// Used for jobs allowed to run N copies fleet-wide: each copy holds one
    /// of N numbered keys. Stops at the first store failure.
    pub async fn acquire_any(
        &self,
        resource_keys: &[String],
        ttl: Duration,
    ) -> Result<Option<LockLease>, StoreError> {
        for key in resource_keys {
            if let Some(lease) = self.acquire(key, ttl).await? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    /// Fail-closed acquisition: a store failure counts as "not acquired".
    pub async fn try_acquire(&self, resource_key: &str, ttl: Duration) -> Option<LockLease> {
        match self.acquire(resource_key, ttl).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(key = %resource_key, error = %e, "Lock store unavailable, treating lease as not acquired");
                None
            }
        }
    }

    /// Extend `lease` to expire `new_ttl` from now.
    ///
    /// Succeeds only while the store still holds this lease's owner token.
    /// Store failures are logged and reported as `false`; the lease then
    /// simply runs out at its current expiry.
    pub async fn renew(&self, lease: &mut LockLease, new_ttl: Duration) -> bool {
        let issued_at = Instant::now();
        match self
            .store
            .cas_extend(&lease.resource_key, &lease.owner_token, new_ttl)
            .await
        {
            Ok(true) => {
                lease.expires_at = deadline_after(issued_at, new_ttl);
                debug!(key = %lease.resource_key, ttl_ms = new_ttl.as_millis() as u64, "Lease renewed");
                true
            }
            Ok(false) => {
                warn!(key = %lease.resource_key, owner = %lease.owner_token, "Lease lost before renewal");
                false
            }
            Err(e) => {
                warn!(key = %lease.resource_key, error = %e, "Lease renewal failed");
                false
            }
        }
    }

    /// Release `lease`. Only deletes the key if this lease still owns it.
    pub async fn release(&self, lease: LockLease) -> bool {
        match self
            .store
            .cas_delete(&lease.resource_key, &lease.owner_token)
            .await
        {
            Ok(true) => {
                debug!(key = %lease.resource_key, "Lease released");
                true
            }
            Ok(false) => {
                debug!(key = %lease.resource_key, "Lease already expired or taken over");
                false
            }
            Err(e) => {
                warn!(key = %lease.resource_key, error = %e, "Lease release failed, leaving it to expire");
                false
            }
        }
    }
}
