//! Concrete [`ledger_core::Ledger`] binding backed by `worker-db`'s
//! `transactions` table (§6 "Relational store": "an atomic withdraw →
//! record transaction pair provided by the refund adapter").
//!
//! Idempotency (P1, no double refund) is enforced by checking for an
//! existing transaction of the relevant kind before writing a new one,
//! rather than by a unique constraint — the operation id is already the
//! natural idempotency key and a duplicate job delivery always observes
//! the same id.

use async_trait::async_trait;
use ledger_core::{DebitOutcome, Ledger, LedgerError, LedgerResult, RefundOutcome};
use std::sync::Arc;
use tracing::{info, warn};
use worker_db::{queries, DatabasePool, Transaction, TransactionKind};

pub struct SqliteLedger {
    db: Arc<DatabasePool>,
}

impl SqliteLedger {
    pub fn new(db: Arc<DatabasePool>) -> Self {
        Self { db }
    }

    fn record(
        &self,
        user_id: &str,
        operation_id: &str,
        kind: TransactionKind,
        amount: f64,
    ) -> LedgerResult<f64> {
        let conn = self.db.get().map_err(|e| LedgerError::Backend(e.to_string()))?;
        conn.execute("BEGIN IMMEDIATE", [])
            .map_err(|e| LedgerError::Backend(e.to_string()))?;

        let result = (|| {
            queries::insert_transaction(
                &conn,
                &Transaction {
                    id: uuid::Uuid::new_v4().to_string(),
                    operation_id: operation_id.to_string(),
                    user_id: user_id.to_string(),
                    kind,
                    amount,
                    created_at: chrono::Utc::now().timestamp(),
                },
            )?;
            queries::get_user_balance(&conn, user_id)
        })();

        match result {
            Ok(balance) => {
                conn.execute("COMMIT", []).map_err(|e| LedgerError::Backend(e.to_string()))?;
                Ok(balance)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(LedgerError::Backend(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn balance(&self, user_id: &str) -> LedgerResult<f64> {
        let conn = self.db.get().map_err(|e| LedgerError::Backend(e.to_string()))?;
        queries::get_user_balance(&conn, user_id).map_err(|e| LedgerError::Backend(e.to_string()))
    }

    async fn debit(&self, user_id: &str, operation_id: &str, amount: f64) -> LedgerResult<DebitOutcome> {
        let conn = self.db.get().map_err(|e| LedgerError::Backend(e.to_string()))?;
        let already = queries::has_transaction_kind(&conn, operation_id, TransactionKind::OperationDeduct)
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        drop(conn);
        if already {
            return Ok(DebitOutcome::AlreadyApplied);
        }

        let new_balance = self.record(user_id, operation_id, TransactionKind::OperationDeduct, amount)?;
        info!(%user_id, %operation_id, amount, "recorded operation deduct");
        Ok(DebitOutcome::Applied { new_balance })
    }

    async fn refund(&self, user_id: &str, operation_id: &str, amount: f64) -> LedgerResult<RefundOutcome> {
        if amount <= 0.0 {
            return Ok(RefundOutcome::Skipped);
        }

        let conn = self.db.get().map_err(|e| LedgerError::Backend(e.to_string()))?;
        let already = queries::has_transaction_kind(&conn, operation_id, TransactionKind::Refund)
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        drop(conn);
        if already {
            warn!(%user_id, %operation_id, "refund already recorded, skipping duplicate");
            return Ok(RefundOutcome::AlreadyApplied);
        }

        let new_balance = self.record(user_id, operation_id, TransactionKind::Refund, amount)?;
        info!(%user_id, %operation_id, amount, "recorded refund");
        Ok(RefundOutcome::Applied { new_balance })
    }
}
