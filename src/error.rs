//! Error types for Tollgate.
//!
//! Only hard failures live here. Being refused by a limit, or losing an
//! optimistic transaction race, is reported through
//! [`Admission`](crate::admission::Admission) instead.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Unknown resource, duplicate restriction or malformed settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller broke a reservation contract, e.g. refunding more than it reserved.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// The backing store failed; never swallowed, so enforcement is not silently disabled.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
