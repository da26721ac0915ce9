//! Resource cache error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResourceCacheError {
    #[error("shared store error: {0}")]
    Store(#[from] session_cache::StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ResourceCacheResult<T> = Result<T, ResourceCacheError>;
