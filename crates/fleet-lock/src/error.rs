//! Lock store error types.

use thiserror::Error;

/// Errors that can occur when talking to a lock store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (network, connection pool, shutdown)
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the operation failed
    #[error("Lock store backend error: {0}")]
    Backend(String),
}
