//! The [`Ledger`] trait: a thin binding interface to the external
//! user-balance ledger (§2 "Refund/Notification adapters", §7).
//!
//! Deliberately abstract, in the same spirit as `upstream-client`: the
//! core only needs "debit this much for this operation" and "refund this
//! much for this operation, idempotently", never the ledger's storage
//! details. `refund-adapter` supplies the concrete binding backed by the
//! relational store's `transactions` table; this crate ships the trait
//! plus an in-memory fake for tests that don't need a real database.

use crate::error::LedgerResult;
use async_trait::async_trait;

/// Outcome of [`Ledger::debit`]. `AlreadyApplied` lets a handler re-run
/// after a crash without double-charging the user on duplicate job
/// delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DebitOutcome {
    Applied { new_balance: f64 },
    AlreadyApplied,
}

/// Outcome of [`Ledger::refund`]. `Skipped` covers the `amount <= 0`
/// case named in §7 ("refund only if amount > 0"); `AlreadyApplied`
/// is the P1 (no double refund) guard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefundOutcome {
    Applied { new_balance: f64 },
    AlreadyApplied,
    Skipped,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current balance for a user, derived from the ledger's own
    /// bookkeeping (never cached by the core).
    async fn balance(&self, user_id: &str) -> LedgerResult<f64>;

    /// Debit `amount` from `user_id` for `operation_id`. Idempotent: a
    /// second call for the same `operation_id` is a no-op that reports
    /// [`DebitOutcome::AlreadyApplied`] rather than debiting twice.
    async fn debit(&self, user_id: &str, operation_id: &str, amount: f64) -> LedgerResult<DebitOutcome>;

    /// Refund `amount` to `user_id` for `operation_id`. A no-op when
    /// `amount <= 0` or a refund for this operation has already been
    /// recorded (P1: no double refund).
    async fn refund(&self, user_id: &str, operation_id: &str, amount: f64) -> LedgerResult<RefundOutcome>;
}
