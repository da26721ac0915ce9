//! `CONFIRM_PURCHASE` (§4.6): the user's final go-ahead on a purchase
//! paused at `AWAITING_FINAL_CONFIRM`. Guarded by a short, single-account
//! lock so a fail-over attempt started by another worker can't clobber
//! the paused view-state while the user is still deciding.

use super::now_ts;
use crate::context::JobContext;
use crate::dispatch::{check_cancelled, run_handler};
use crate::error::{JobProcessorError, JobProcessorResult};
use crate::job::Job;
use crate::login::{login_fresh, LoginDeps};
use crate::session_retry::with_session_retry;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::info;
use upstream_client::UpstreamClient;
use worker_db::{queries, Operation, OperationStatus, ResponseData};

const ACCOUNT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const ACCOUNT_LOCK_POLL: Duration = Duration::from_secs(1);
const SNAPSHOT_MAX_AGE_SECS: i64 = 30 * 60;

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
    if !matches!(op.status, OperationStatus::AwaitingFinalConfirm | OperationStatus::Completing) {
        // Either already terminal or not at the expected checkpoint yet;
        // either way this delivery has nothing new to do.
        return Err(JobProcessorError::DuplicateDelivery);
    }

    if let Some(expiry) = op.final_confirm_expiry {
        if now_ts() > expiry {
            return run_handler(
                &ctx.db,
                ctx.ledger.as_ref(),
                &job.operation_id,
                &job.user_id,
                job.amount,
                async { Err(JobProcessorError::ConfirmationTimeout) },
            )
            .await;
        }
    }

    {
        let conn = ctx.db.get()?;
        let claimed = queries::update_status_if(&conn, &job.operation_id, op.status, OperationStatus::Completing, now_ts())?;
        if !claimed {
            // Another delivery of this job already won the race into
            // Completing; don't re-run the upstream confirm/pay call.
            return Err(JobProcessorError::DuplicateDelivery);
        }
    }

    run_handler(
        &ctx.db,
        ctx.ledger.as_ref(),
        &job.operation_id,
        &job.user_id,
        job.amount,
        run_body(ctx, job, &op),
    )
    .await
}

async fn run_body<C, F>(ctx: &JobContext<C, F>, job: &Job, op: &Operation) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let account_id = op
        .account_id
        .clone()
        .ok_or_else(|| JobProcessorError::InvariantViolation("no account assigned before CONFIRM_PURCHASE".into()))?;

    check_cancelled(&ctx.db, &job.operation_id).await?;

    let account = ctx
        .account_pool
        .acquire_specific(&account_id, &ctx.worker_id, ACCOUNT_LOCK_TIMEOUT, ACCOUNT_LOCK_POLL)
        .await?
        .ok_or_else(|| JobProcessorError::NoAvailableAccounts(format!("could not lock account {account_id} for confirmation")))?;

    let result = confirm(ctx, job, op, &account).await;
    let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
    result
}

async fn confirm<C, F>(ctx: &JobContext<C, F>, job: &Job, op: &Operation, account: &worker_db::DealerAccount) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let account_id = account.id.as_str();
    let (session, saved_at) = match &op.response_data {
        Some(ResponseData::AwaitingFinalConfirmSnapshot { session, saved_at, .. }) => (session.clone(), *saved_at),
        _ => {
            return Err(JobProcessorError::InvariantViolation(
                "no final-confirm session snapshot to restore".into(),
            ))
        }
    };
    if now_ts() - saved_at > SNAPSHOT_MAX_AGE_SECS {
        return Err(JobProcessorError::SessionExpired);
    }

    let client_handle = ctx.clients.get_or_create(account_id);
    let mut client = client_handle.lock().await;
    client.import_session(serde_json::from_value(session)?);

    check_cancelled(&ctx.db, &job.operation_id).await?;

    let login_deps = LoginDeps {
        session_cache: &ctx.session_cache,
        db: &ctx.db,
        captcha_solver: ctx.captcha_solver.as_deref(),
        worker_id: &ctx.worker_id,
        captcha_timeout: ctx.captcha_timeout,
    };

    let result = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<upstream_client::ConfirmResult>> + Send + '_>> {
            c.confirm_purchase()
        },
        |r: &upstream_client::ConfirmResult| {
            !r.success
                && upstream_client::UpstreamError::looks_like_session_expired(&r.message)
        },
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, &login_deps))
        },
    )
    .await?;

    if !result.success {
        return Err(JobProcessorError::UpstreamTransient(result.message));
    }

    let _ = ctx.resource_cache.invalidate_packages(&job.card_number).await;

    let now = now_ts();
    let conn = ctx.db.get()?;
    let current = queries::get_operation(&conn, &job.operation_id)?
        .ok_or_else(|| JobProcessorError::InvariantViolation("operation vanished mid-confirmation".into()))?;
    let updated = queries::update_operation_if(
        &conn,
        &job.operation_id,
        current.status,
        OperationStatus::Completed,
        None,
        None,
        None,
        Some(&result.message),
        None,
        None,
        Some(now),
        now,
    )?;
    drop(conn);
    if !updated {
        return Err(JobProcessorError::DuplicateDelivery);
    }

    ctx.account_pool.mark_used(account_id).await?;
    ctx.notifier
        .notify_user(&job.user_id, "Your purchase is confirmed.")
        .await;
    info!(operation_id = %job.operation_id, %account_id, "purchase confirmed");
    Ok(())
}
