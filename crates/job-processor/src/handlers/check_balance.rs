//! `CHECK_ACCOUNT_BALANCE` (§4.6): an admin-triggered probe, not a user
//! operation. Logs in with whatever session is available and asks
//! upstream for the account's current dealer balance; does not touch the
//! account pool's lease/queue since nothing here contends with a user
//! operation for the account.

use super::{mark_processing, now_ts};
use crate::context::JobContext;
use crate::dispatch::run_handler;
use crate::error::{JobProcessorError, JobProcessorResult};
use crate::job::Job;
use crate::login::{ensure_session, login_fresh, LoginDeps};
use crate::session_retry::with_session_retry;
use std::future::Future;
use std::pin::Pin;
use tracing::info;
use upstream_client::UpstreamClient;
use worker_db::{queries, OperationStatus};

pub async fn handle<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    mark_processing(&ctx.db, &job.operation_id, OperationStatus::Pending).await?;
    run_handler(
        &ctx.db,
        ctx.ledger.as_ref(),
        &job.operation_id,
        &job.user_id,
        0.0,
        run_body(ctx, job),
    )
    .await
}

async fn run_body<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let account_id = job
        .account_id
        .clone()
        .ok_or_else(|| JobProcessorError::InvariantViolation("CHECK_ACCOUNT_BALANCE requires an account_id".into()))?;

    let account = {
        let conn = ctx.db.get()?;
        queries::get_dealer_account(&conn, &account_id)?
            .ok_or_else(|| JobProcessorError::InvariantViolation(format!("unknown account {account_id}")))?
    };

    let client_handle = ctx.clients.get_or_create(&account_id);
    let mut client = client_handle.lock().await;
    let login_deps = LoginDeps {
        session_cache: &ctx.session_cache,
        db: &ctx.db,
        captcha_solver: ctx.captcha_solver.as_deref(),
        worker_id: &ctx.worker_id,
        captcha_timeout: ctx.captcha_timeout,
    };
    ensure_session(&mut *client, &account, &job.operation_id, &login_deps).await?;

    let balance = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<f64>> + Send + '_>> {
            c.fetch_dealer_balance(&job.card_number)
        },
        |_: &f64| false,
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, &account, &job.operation_id, &login_deps))
        },
    )
    .await?;

    ctx.account_pool.update_balance(&account_id, balance).await?;

    let now = now_ts();
    let conn = ctx.db.get()?;
    let current = queries::get_operation(&conn, &job.operation_id)?
        .ok_or_else(|| JobProcessorError::InvariantViolation("operation vanished mid-balance-check".into()))?;
    let updated = queries::update_operation_if(
        &conn,
        &job.operation_id,
        current.status,
        OperationStatus::Completed,
        None,
        None,
        None,
        Some(&format!("balance: {balance:.2}")),
        None,
        None,
        Some(now),
        now,
    )?;
    drop(conn);
    if !updated {
        return Err(JobProcessorError::DuplicateDelivery);
    }

    info!(operation_id = %job.operation_id, %account_id, balance, "account balance refreshed");
    Ok(())
}
