//! Distributed mutual exclusion for fleet-scheduler.
//!
//! Provides:
//! - The `LockStore` contract: atomic set-if-absent, extend and delete,
//!   each conditioned on the stored owner token
//! - `MemoryLockStore`, an in-process store shared between scheduler
//!   instances of one process (and used throughout the tests)
//! - `DistributedLock`, the lease client with owner-token fencing
//!
//! The lock never trusts in-process state for exclusivity: the store's
//! compare-and-set is the only arbiter of who holds a key.

pub mod error;
pub mod lock;
pub mod store;

pub use error::StoreError;
pub use lock::{DistributedLock, LockLease};
pub use store::{deadline_after, LockStore, MemoryLockStore};
