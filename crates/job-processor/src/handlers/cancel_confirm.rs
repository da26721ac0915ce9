//! `CANCEL_CONFIRM` (§4.6): the user backs out of a purchase paused at
//! `AWAITING_FINAL_CONFIRM`/`COMPLETING`. Idempotent and best-effort
//! toward upstream: whatever state the portal is in, the user gets their
//! money back and the account is freed.

use super::now_ts;
use crate::context::JobContext;
use crate::error::{JobProcessorError, JobProcessorResult};
use crate::job::Job;
use upstream_client::UpstreamClient;
use worker_db::{queries, OperationStatus};

pub async fn handle<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let op = {
        let conn = ctx.db.get()?;
        queries::get_operation(&conn, &job.operation_id)?
            .ok_or_else(|| JobProcessorError::InvariantViolation("operation missing at dispatch".into()))?
    };

    if op.status == OperationStatus::Cancelled {
        return Ok(());
    }
    if !matches!(op.status, OperationStatus::AwaitingFinalConfirm | OperationStatus::Completing) {
        return Err(JobProcessorError::DuplicateDelivery);
    }

    if let Some(account_id) = &op.account_id {
        let client_handle = ctx.clients.get_or_create(account_id);
        let mut client = client_handle.lock().await;
        if let Err(err) = client.cancel_purchase().await {
            tracing::warn!(operation_id = %job.operation_id, account_id, error = %err, "best-effort cancel_purchase call failed upstream");
        }
    }

    if job.amount > 0.0 {
        let _ = ctx.ledger.refund(&job.user_id, &job.operation_id, job.amount).await?;
    }

    let now = now_ts();
    let conn = ctx.db.get()?;
    let updated = queries::update_status_if(&conn, &job.operation_id, op.status, OperationStatus::Cancelled, now)?;
    drop(conn);
    if !updated {
        return Err(JobProcessorError::DuplicateDelivery);
    }

    if let Some(account_id) = &op.account_id {
        ctx.account_pool.force_release(account_id).await?;
    }
    ctx.notifier
        .notify_user(&job.user_id, "Your operation was cancelled.")
        .await;
    tracing::info!(operation_id = %job.operation_id, "operation cancelled by user");
    Ok(())
}
