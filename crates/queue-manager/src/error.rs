//! Queue manager error types.

use thiserror::Error;

/// Queue manager error type.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Account pool error
    #[error("account pool error: {0}")]
    Pool(#[from] account_pool::AccountPoolError),

    /// Shared store error
    #[error("shared store error: {0}")]
    Store(#[from] session_cache::StoreError),
}

/// Result type alias using QueueError.
pub type QueueResult<T> = Result<T, QueueError>;
