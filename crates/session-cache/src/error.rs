//! Error type for the shared store and the session cache built on it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("shared store operation timed out")]
    Timeout,
}

pub type StoreResult<T> = Result<T, StoreError>;
