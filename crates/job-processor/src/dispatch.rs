//! The shared handler wrapper (§4.6, §8 P2/P4): every operation handler
//! runs inside [`run_handler`], which turns "the handler returned an
//! error" into the right side effect — refund-and-fail for a real
//! failure, silent early return for cancellation or a duplicate
//! delivery — without each handler re-implementing that bookkeeping.
//!
//! [`LeaseHeartbeat`] is the other half: once a handler leases an
//! account it starts one of these so a long-running operation never
//! loses its lease to the 60-s TTL mid-flight (P4).

use crate::error::{JobProcessorError, JobProcessorResult};
use account_pool::AccountPool;
use ledger_core::Ledger;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use worker_core::ErrorKind;
use worker_db::{queries, DatabasePool, OperationStatus};

/// Renew interval: well inside `account_pool::LEASE_TTL` (60 s) so a
/// slow GC pause or scheduling hiccup never races the lease's expiry.
const LEASE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Background renewal of a held account lease. Dropping or calling
/// [`LeaseHeartbeat::stop`] cancels the task; it does not itself release
/// the lease; callers still call `AccountPool::release` explicitly.
pub struct LeaseHeartbeat {
    handle: JoinHandle<()>,
}

impl LeaseHeartbeat {
    pub fn start(pool: Arc<AccountPool>, account_id: impl Into<String>) -> Self {
        let account_id = account_id.into();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_HEARTBEAT_INTERVAL).await;
                match pool.renew_lease(&account_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%account_id, "lease renewal found no lease to renew, stopping heartbeat");
                        break;
                    }
                    Err(err) => {
                        error!(%account_id, error = %err, "lease renewal failed");
                        break;
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Cancellation checkpoint (§5 "cooperative asynchronous tasks... may
/// suspend at... explicit delays"): handlers call this at natural await
/// points (before an upstream round trip, after a wait) so a
/// user-cancelled operation stops promptly instead of running to
/// completion and only then discovering it was unwanted.
pub async fn check_cancelled(db: &DatabasePool, operation_id: &str) -> JobProcessorResult<()> {
    let cancelled = {
        let conn = db.get()?;
        queries::is_cancelled(&conn, operation_id)?
    };
    if cancelled {
        return Err(JobProcessorError::Cancelled);
    }
    Ok(())
}

/// Run a handler body, translating its error (if any) into the right
/// side effect. `operation_id`/`user_id`/`amount` describe the job the
/// handler was given; `amount` is whatever the operation's ledger
/// exposure currently is (usually `job.amount`, but callers pass the
/// freshly-read value for flows that mutate it, e.g. installments).
pub async fn run_handler<Fut>(
    db: &DatabasePool,
    ledger: &dyn Ledger,
    operation_id: &str,
    user_id: &str,
    amount: f64,
    handler: Fut,
) -> JobProcessorResult<()>
where
    Fut: std::future::Future<Output = JobProcessorResult<()>>,
{
    match handler.await {
        Ok(()) => Ok(()),
        Err(err) => {
            let kind = err.kind();
            if kind != ErrorKind::Cancelled && kind != ErrorKind::DuplicateDelivery {
                fail_operation(db, operation_id, kind).await?;
                if kind.refunds() && amount > 0.0 {
                    if let Err(refund_err) = ledger.refund(user_id, operation_id, amount).await {
                        error!(%operation_id, error = %refund_err, "refund after failed operation did not go through");
                    }
                }
            }
            Err(err)
        }
    }
}

async fn fail_operation(db: &DatabasePool, operation_id: &str, kind: ErrorKind) -> JobProcessorResult<()> {
    let now = now_ts();
    let conn = db.get()?;
    if let Some(op) = queries::get_operation(&conn, operation_id)? {
        if !op.status.is_terminal() {
            let updated = queries::update_status_if(&conn, operation_id, op.status, OperationStatus::Failed, now)?;
            if updated {
                warn!(%operation_id, ?kind, "operation failed");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::InMemoryLedger;
    use worker_db::{queries as q, Operation, OperationType, PoolConfig};

    fn test_db() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap().into_path();
        DatabasePool::open(&dir.join("dispatch_test.db"), PoolConfig::default()).unwrap()
    }

    fn seed(db: &DatabasePool, id: &str, user_id: &str, amount: f64) {
        let conn = db.get().unwrap();
        q::insert_operation(
            &conn,
            &Operation {
                id: id.into(),
                user_id: user_id.into(),
                op_type: OperationType::CompletePurchase,
                status: OperationStatus::Processing,
                card_number: "1234567890".into(),
                account_id: None,
                amount,
                selected_package: None,
                stb_number: None,
                captcha_image: None,
                captcha_solution: None,
                response_data: None,
                response_message: None,
                heartbeat_at: None,
                heartbeat_expiry: None,
                final_confirm_expiry: None,
                completed_at: None,
                created_at: 0,
                updated_at: 0,
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn failure_marks_operation_failed_and_refunds() {
        let db = test_db();
        seed(&db, "op1", "u1", 50.0);
        let ledger = InMemoryLedger::with_balance("u1", 0.0);

        let result = run_handler(&db, &ledger, "op1", "u1", 50.0, async {
            Err(JobProcessorError::UpstreamTransient("boom".into()))
        })
        .await;

        assert!(result.is_err());
        let op = q::get_operation(&db.get().unwrap(), "op1").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(ledger.balance("u1").await.unwrap(), 50.0);
    }

    #[tokio::test]
    async fn cancelled_early_return_does_not_touch_status_or_ledger() {
        let db = test_db();
        seed(&db, "op2", "u1", 50.0);
        let ledger = InMemoryLedger::with_balance("u1", 0.0);

        let result = run_handler(&db, &ledger, "op2", "u1", 50.0, async {
            Err(JobProcessorError::Cancelled)
        })
        .await;

        assert!(result.is_err());
        let op = q::get_operation(&db.get().unwrap(), "op2").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Processing);
        assert_eq!(ledger.balance("u1").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_pure_noop() {
        let db = test_db();
        seed(&db, "op3", "u1", 50.0);
        let ledger = InMemoryLedger::with_balance("u1", 0.0);

        let result = run_handler(&db, &ledger, "op3", "u1", 50.0, async {
            Err(JobProcessorError::DuplicateDelivery)
        })
        .await;

        assert!(result.is_err());
        let op = q::get_operation(&db.get().unwrap(), "op3").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Processing);
        assert_eq!(ledger.balance("u1").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn success_leaves_status_alone() {
        let db = test_db();
        seed(&db, "op4", "u1", 0.0);
        let ledger = InMemoryLedger::with_balance("u1", 0.0);

        run_handler(&db, &ledger, "op4", "u1", 0.0, async { Ok(()) })
            .await
            .unwrap();

        let op = q::get_operation(&db.get().unwrap(), "op4").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Processing);
    }

    #[tokio::test]
    async fn check_cancelled_detects_a_user_cancelled_operation() {
        let db = test_db();
        seed(&db, "op5", "u1", 0.0);
        {
            let conn = db.get().unwrap();
            q::update_status_if(&conn, "op5", OperationStatus::Processing, OperationStatus::Cancelled, 1).unwrap();
        }
        let err = check_cancelled(&db, "op5").await.unwrap_err();
        assert!(matches!(err, JobProcessorError::Cancelled));
    }
}
