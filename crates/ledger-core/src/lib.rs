//! Thin binding interface to the external user-balance ledger (§2
//! "Refund/Notification adapters", §7 error handling design).
//!
//! The worker-tier core never owns money movement directly: it debits a
//! user when it starts spending on their behalf and refunds them,
//! idempotently, whenever an operation fails or is cancelled. This crate
//! defines that contract abstractly; `refund-adapter` binds it to the
//! relational store's `transactions` table.

mod error;
mod fake;
mod ledger;

pub use error::{LedgerError, LedgerResult};
pub use fake::InMemoryLedger;
pub use ledger::{DebitOutcome, Ledger, RefundOutcome};
