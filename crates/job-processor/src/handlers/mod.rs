//! Per-operation-type handlers (§4.6): one module per job type, each
//! exposing a single `handle()` entry point the worker's dispatch loop
//! calls by `job.op_type`.

pub mod cancel_confirm;
pub mod check_balance;
pub mod complete_purchase;
pub mod confirm_purchase;
pub mod installment;
pub mod signal;
pub mod start_renewal;

use crate::error::{JobProcessorError, JobProcessorResult};
use worker_db::{queries, DatabasePool, OperationStatus};

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Transition an operation from `expected` to `PROCESSING`. Tolerates a
/// duplicate delivery that already made this jump (a crashed worker's
/// retry lands here again) and rejects one that arrives after the
/// operation went terminal.
pub(crate) async fn mark_processing(
    db: &DatabasePool,
    operation_id: &str,
    expected: OperationStatus,
) -> JobProcessorResult<()> {
    let conn = db.get()?;
    let op = queries::get_operation(&conn, operation_id)?
        .ok_or_else(|| JobProcessorError::InvariantViolation("operation missing at dispatch".into()))?;
    if op.status.is_terminal() {
        return Err(JobProcessorError::DuplicateDelivery);
    }
    if op.status != expected {
        return Ok(());
    }
    queries::update_status_if(&conn, operation_id, expected, OperationStatus::Processing, now_ts())?;
    Ok(())
}
