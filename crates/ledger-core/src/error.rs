//! Error type for [`crate::Ledger`] implementations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backend error: {0}")]
    Backend(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
