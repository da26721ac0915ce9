//! In-memory [`Ledger`] fake for tests that don't need a real database
//! (§2.1 Test tooling), mirroring the `ScriptedUpstreamClient` pattern:
//! the interface and its test double ship together.

use crate::error::LedgerResult;
use crate::ledger::{DebitOutcome, Ledger, RefundOutcome};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryLedger {
    balances: Mutex<HashMap<String, f64>>,
    debited_operations: Mutex<HashSet<String>>,
    refunded_operations: Mutex<HashSet<String>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(user_id: impl Into<String>, balance: f64) -> Self {
        let ledger = Self::new();
        ledger.balances.lock().unwrap().insert(user_id.into(), balance);
        ledger
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn balance(&self, user_id: &str) -> LedgerResult<f64> {
        Ok(*self.balances.lock().unwrap().get(user_id).unwrap_or(&0.0))
    }

    async fn debit(&self, user_id: &str, operation_id: &str, amount: f64) -> LedgerResult<DebitOutcome> {
        let mut debited = self.debited_operations.lock().unwrap();
        if !debited.insert(operation_id.to_string()) {
            return Ok(DebitOutcome::AlreadyApplied);
        }
        let mut balances = self.balances.lock().unwrap();
        let entry = balances.entry(user_id.to_string()).or_insert(0.0);
        *entry -= amount;
        Ok(DebitOutcome::Applied { new_balance: *entry })
    }

    async fn refund(&self, user_id: &str, operation_id: &str, amount: f64) -> LedgerResult<RefundOutcome> {
        if amount <= 0.0 {
            return Ok(RefundOutcome::Skipped);
        }
        let mut refunded = self.refunded_operations.lock().unwrap();
        if !refunded.insert(operation_id.to_string()) {
            return Ok(RefundOutcome::AlreadyApplied);
        }
        let mut balances = self.balances.lock().unwrap();
        let entry = balances.entry(user_id.to_string()).or_insert(0.0);
        *entry += amount;
        Ok(RefundOutcome::Applied { new_balance: *entry })
    }
}
