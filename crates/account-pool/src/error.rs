//! Account pool error types.

use thiserror::Error;

/// Account pool error type.
#[derive(Error, Debug)]
pub enum AccountPoolError {
    /// Relational store error
    #[error("database error: {0}")]
    Database(#[from] worker_db::DatabaseError),

    /// Shared store error
    #[error("shared store error: {0}")]
    Store(#[from] session_cache::StoreError),

    /// No account satisfied the acquisition criteria
    #[error("no available accounts")]
    NoAvailableAccounts,
}

/// Result type alias using AccountPoolError.
pub type AccountPoolResult<T> = Result<T, AccountPoolError>;
