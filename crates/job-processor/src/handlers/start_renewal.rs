//! `START_RENEWAL` (§4.6): login, load the card's packages, and pause at
//! `AWAITING_PACKAGE` for the user to pick one.

use crate::context::JobContext;
use crate::dispatch::{check_cancelled, run_handler, LeaseHeartbeat};
use crate::error::{JobProcessorError, JobProcessorResult};
use crate::job::Job;
use crate::login::{ensure_session, login_fresh, LoginDeps};
use crate::session_retry::with_session_retry;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use upstream_client::{LoadPackagesResult, UpstreamClient, UpstreamResult};
use worker_db::{queries, DealerAccount, OperationStatus, ResponseData};

const QUEUE_TIMEOUT: Duration = Duration::from_secs(120);
const FINAL_CONFIRM_WINDOW_SECS: i64 = 120;
const AWAITING_PACKAGE_HEARTBEAT_SECS: i64 = 15;

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub async fn handle<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    super::mark_processing(&ctx.db, &job.operation_id, OperationStatus::Pending).await?;
    run_handler(
        &ctx.db,
        ctx.ledger.as_ref(),
        &job.operation_id,
        &job.user_id,
        job.amount,
        run_body(ctx, job),
    )
    .await
}

async fn run_body<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let outcome = ctx
        .queue
        .acquire_with_queue_timeout(&job.operation_id, &ctx.worker_id, &[], None, QUEUE_TIMEOUT)
        .await?;
    let account = outcome
        .account
        .ok_or_else(|| JobProcessorError::NoAvailableAccounts(job.operation_id.clone()))?;
    let heartbeat = LeaseHeartbeat::start(Arc::clone(&ctx.account_pool), account.id.clone());

    let result = do_renewal(ctx, job, &account).await;

    heartbeat.stop();
    let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
    result
}

async fn do_renewal<C, F>(ctx: &JobContext<C, F>, job: &Job, account: &DealerAccount) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    check_cancelled(&ctx.db, &job.operation_id).await?;

    let client_handle = ctx.clients.get_or_create(&account.id);
    let mut client = client_handle.lock().await;

    let login_deps = LoginDeps {
        session_cache: &ctx.session_cache,
        db: &ctx.db,
        captcha_solver: ctx.captcha_solver.as_deref(),
        worker_id: &ctx.worker_id,
        captcha_timeout: ctx.captcha_timeout,
    };
    ensure_session(&mut *client, account, &job.operation_id, &login_deps).await?;

    check_cancelled(&ctx.db, &job.operation_id).await?;

    let cached_stb = ctx
        .resource_cache
        .get_stb(&job.card_number)
        .await
        .unwrap_or(None);

    let (stb_number, packages_result) = if let Some(stb) = cached_stb {
        let packages = load_packages_with_retry(
            &mut *client,
            account,
            &job.operation_id,
            &login_deps,
            &job.card_number,
            &job.smartcard_type,
        )
        .await?;
        (Some(stb), packages)
    } else {
        // check_card and the first load_packages attempt only need shared
        // access, so they still run concurrently; a relogin (needs unique
        // access) only happens afterward, on the rare expired-session path.
        let (check_card, first_attempt) = tokio::join!(
            client.check_card(&job.card_number),
            client.load_packages(&job.card_number, &job.smartcard_type),
        );
        let packages = retry_load_packages_if_expired(
            &mut *client,
            account,
            &job.operation_id,
            &login_deps,
            first_attempt,
            &job.card_number,
            &job.smartcard_type,
        )
        .await?;
        match check_card {
            Ok(stb) => (stb, packages),
            Err(err) => {
                warn!(operation_id = %job.operation_id, error = %err, "check_card failed, continuing without an STB number");
                (None, packages)
            }
        }
    };

    if !packages_result.success {
        return Err(JobProcessorError::UpstreamTransient(
            packages_result.error.unwrap_or_else(|| "load_packages failed".into()),
        ));
    }

    if let Some(balance) = packages_result.dealer_balance {
        let _ = ctx.account_pool.update_balance(&account.id, balance).await;
    }
    let _ = ctx
        .resource_cache
        .put_packages(&job.card_number, &packages_result.packages)
        .await;
    if let Some(stb) = &stb_number {
        let _ = ctx.resource_cache.put_stb(&job.card_number, stb).await;
    }

    let session = client
        .export_session()
        .ok_or_else(|| JobProcessorError::InvariantViolation("no session to snapshot after successful login".into()))?;
    let now = now_ts();
    let response_data = ResponseData::AwaitingPackageSnapshot {
        session: serde_json::to_value(&session)?,
        dealer_balance: packages_result.dealer_balance,
        saved_at: now,
        smartcard_type: job.smartcard_type.clone(),
    };

    let conn = ctx.db.get()?;
    let op = queries::get_operation(&conn, &job.operation_id)?
        .ok_or_else(|| JobProcessorError::InvariantViolation("operation vanished before snapshot write".into()))?;
    let updated = queries::update_operation_if(
        &conn,
        &job.operation_id,
        op.status,
        OperationStatus::AwaitingPackage,
        Some(&account.id),
        None,
        Some(&response_data),
        None,
        Some(now + FINAL_CONFIRM_WINDOW_SECS),
        Some(now + AWAITING_PACKAGE_HEARTBEAT_SECS),
        None,
        now,
    )?;
    if !updated {
        return Err(JobProcessorError::DuplicateDelivery);
    }
    queries::clear_captcha_fields(&conn, &job.operation_id)?;
    drop(conn);

    info!(operation_id = %job.operation_id, account_id = %account.id, "packages loaded, awaiting user selection");
    Ok(())
}

fn packages_look_expired(r: &LoadPackagesResult) -> bool {
    r.error
        .as_deref()
        .map(upstream_client::UpstreamError::looks_like_session_expired)
        .unwrap_or(false)
}

async fn load_packages_with_retry<C: UpstreamClient>(
    client: &mut C,
    account: &DealerAccount,
    operation_id: &str,
    login_deps: &LoginDeps<'_>,
    card: &str,
    smartcard_type: &str,
) -> JobProcessorResult<LoadPackagesResult> {
    with_session_retry(
        client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = UpstreamResult<LoadPackagesResult>> + Send + '_>> {
            c.load_packages(card, smartcard_type)
        },
        packages_look_expired,
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, operation_id, login_deps))
        },
    )
    .await
}

/// `check_card` and the first `load_packages` attempt already ran
/// concurrently against a shared borrow of `client`; this only takes the
/// unique borrow relogin needs when that first attempt came back looking
/// session-expired.
async fn retry_load_packages_if_expired<C: UpstreamClient>(
    client: &mut C,
    account: &DealerAccount,
    operation_id: &str,
    login_deps: &LoginDeps<'_>,
    first_attempt: UpstreamResult<LoadPackagesResult>,
    card: &str,
    smartcard_type: &str,
) -> JobProcessorResult<LoadPackagesResult> {
    let needs_relogin = match &first_attempt {
        Ok(r) => packages_look_expired(r),
        Err(upstream_client::UpstreamError::SessionExpired) => true,
        Err(err) => upstream_client::UpstreamError::looks_like_session_expired(&err.to_string()),
    };
    if !needs_relogin {
        return Ok(first_attempt?);
    }
    login_fresh(client, account, operation_id, login_deps).await?;
    Ok(client.load_packages(card, smartcard_type).await?)
}
