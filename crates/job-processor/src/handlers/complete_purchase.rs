//! `COMPLETE_PURCHASE` (§4.6): account fail-over loop that turns a
//! user's package selection into an upstream purchase, pausing at
//! `AWAITING_FINAL_CONFIRM` for the user's final go-ahead.

use super::{mark_processing, now_ts};
use crate::context::JobContext;
use crate::dispatch::{check_cancelled, run_handler, LeaseHeartbeat};
use crate::error::{JobProcessorError, JobProcessorResult};
use crate::job::Job;
use crate::login::{ensure_session, login_fresh, LoginDeps};
use crate::session_retry::with_session_retry;
use account_pool::FailureReason;
use resource_cache::PackageOption;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use upstream_client::{CompletePurchaseResult, UpstreamClient};
use worker_db::{queries, DealerAccount, Operation, OperationStatus, ResponseData};

const SNAPSHOT_MAX_AGE_SECS: i64 = 60 * 60;
const FINAL_CONFIRM_WINDOW_SECS: i64 = 30;
const MAX_ATTEMPTS: usize = 8;

pub async fn handle<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    mark_processing(&ctx.db, &job.operation_id, OperationStatus::AwaitingPackage).await?;
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

fn package_for(op: &Operation) -> JobProcessorResult<String> {
    op.selected_package
        .clone()
        .ok_or_else(|| JobProcessorError::InvariantViolation("no package selected before COMPLETE_PURCHASE".into()))
}

async fn run_body<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let op = {
        let conn = ctx.db.get()?;
        queries::get_operation(&conn, &job.operation_id)?
            .ok_or_else(|| JobProcessorError::InvariantViolation("operation missing at dispatch".into()))?
    };
    let package_id = package_for(&op)?;
    let original_account_id = op.account_id.clone();
    let package_price = lookup_price(ctx, &job.card_number, &package_id).await?;

    let mut tried: Vec<String> = Vec::new();
    let mut min_balance: Option<f64> = None;

    for _ in 0..MAX_ATTEMPTS {
        check_cancelled(&ctx.db, &job.operation_id).await?;

        let account = ctx
            .account_pool
            .acquire(&ctx.worker_id, &tried, min_balance)
            .await?;
        let Some(account) = account else {
            let reason = if min_balance.is_some() {
                "every candidate dealer account had insufficient balance"
            } else {
                "no dealer account is currently available"
            };
            return Err(JobProcessorError::NoAvailableAccounts(reason.into()));
        };

        {
            let conn = ctx.db.get()?;
            queries::update_operation_if(
                &conn,
                &job.operation_id,
                op.status,
                OperationStatus::Processing,
                Some(&account.id),
                None,
                None,
                None,
                None,
                None,
                None,
                now_ts(),
            )?;
        }

        let heartbeat = LeaseHeartbeat::start(Arc::clone(&ctx.account_pool), account.id.clone());
        let is_original = original_account_id.as_deref() == Some(account.id.as_str());
        let outcome = attempt(ctx, job, &op, &account, is_original, package_price).await;

        match outcome {
            Ok(()) => {
                heartbeat.stop();
                let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
                return Ok(());
            }
            Err(JobProcessorError::InsufficientDealerBalance) => {
                heartbeat.stop();
                ctx.account_pool
                    .mark_failed(&account.id, FailureReason::InsufficientBalance)
                    .await?;
                ctx.notifier
                    .notify_admins(
                        "Dealer account balance shortfall",
                        &format!("account {} could not cover package {package_id} (price {package_price})", account.id),
                    )
                    .await;
                tried.push(account.id.clone());
                min_balance = Some(package_price);
            }
            Err(err) if classify_retry(&err) => {
                heartbeat.stop();
                let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
                warn!(operation_id = %job.operation_id, account_id = %account.id, error = %err, "attempt failed, trying a different account");
                tried.push(account.id.clone());
            }
            Err(err) => {
                heartbeat.stop();
                let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
                return Err(err);
            }
        }
    }

    Err(JobProcessorError::NoAvailableAccounts(
        "exhausted dealer account candidates for this purchase".into(),
    ))
}

async fn lookup_price<C, F>(ctx: &JobContext<C, F>, card: &str, package_id: &str) -> JobProcessorResult<f64>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let packages = ctx.resource_cache.get_packages(card).await.unwrap_or(None);
    let found = packages.and_then(|pkgs: Vec<PackageOption>| pkgs.into_iter().find(|p| p.id == package_id));
    found
        .map(|p| p.price)
        .ok_or_else(|| JobProcessorError::InvariantViolation("selected package not found in the cached list".into()))
}

async fn attempt<C, F>(
    ctx: &JobContext<C, F>,
    job: &Job,
    op: &Operation,
    account: &DealerAccount,
    is_original: bool,
    package_price: f64,
) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let client_handle = ctx.clients.get_or_create(&account.id);
    let mut client = client_handle.lock().await;

    let login_deps = LoginDeps {
        session_cache: &ctx.session_cache,
        db: &ctx.db,
        captcha_solver: ctx.captcha_solver.as_deref(),
        worker_id: &ctx.worker_id,
        captcha_timeout: ctx.captcha_timeout,
    };

    let dealer_balance = if is_original {
        if let Some(ResponseData::AwaitingPackageSnapshot { session, dealer_balance, saved_at, .. }) = &op.response_data {
            if now_ts() - saved_at <= SNAPSHOT_MAX_AGE_SECS {
                let session: session_cache::Session = serde_json::from_value(session.clone())?;
                client.import_session(session);
                ensure_session(&mut *client, account, &job.operation_id, &login_deps).await?;
                *dealer_balance
            } else {
                reload_from_scratch(&mut *client, account, job, &login_deps).await?
            }
        } else {
            reload_from_scratch(&mut *client, account, job, &login_deps).await?
        }
    } else {
        reload_from_scratch(&mut *client, account, job, &login_deps).await?
    };

    if dealer_balance.map(|b| b < package_price).unwrap_or(false) {
        return Err(JobProcessorError::InsufficientDealerBalance);
    }

    let promo = job.promo_code.as_deref();
    let stb = op.stb_number.as_deref();
    let package_id = package_for(op)?;

    check_cancelled(&ctx.db, &job.operation_id).await?;

    let result: CompletePurchaseResult = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<CompletePurchaseResult>> + Send + '_>> {
            c.complete_purchase(&package_id, promo, stb, true)
        },
        |_: &CompletePurchaseResult| false,
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, &login_deps))
        },
    )
    .await?;

    if !result.awaiting_confirm {
        return Err(JobProcessorError::UpstreamTransient(result.message));
    }

    let session = client
        .export_session()
        .ok_or_else(|| JobProcessorError::InvariantViolation("no session to snapshot after complete_purchase".into()))?;
    let now = now_ts();
    let response_data = ResponseData::AwaitingFinalConfirmSnapshot {
        session: serde_json::to_value(&session)?,
        dealer_balance,
        saved_at: now,
        is_installment: false,
    };

    let conn = ctx.db.get()?;
    let current = queries::get_operation(&conn, &job.operation_id)?
        .ok_or_else(|| JobProcessorError::InvariantViolation("operation vanished mid-purchase".into()))?;
    let updated = queries::update_operation_if(
        &conn,
        &job.operation_id,
        current.status,
        OperationStatus::AwaitingFinalConfirm,
        Some(&account.id),
        None,
        Some(&response_data),
        Some(&result.message),
        Some(now + FINAL_CONFIRM_WINDOW_SECS),
        None,
        None,
        now,
    )?;
    drop(conn);
    if !updated {
        return Err(JobProcessorError::DuplicateDelivery);
    }

    ctx.notifier
        .notify_user(&job.user_id, "Your purchase is ready, please confirm within 30 seconds.")
        .await;
    info!(operation_id = %job.operation_id, account_id = %account.id, "purchase awaiting final confirmation");
    Ok(())
}

async fn reload_from_scratch<C: UpstreamClient>(
    client: &mut C,
    account: &DealerAccount,
    job: &Job,
    login_deps: &LoginDeps<'_>,
) -> JobProcessorResult<Option<f64>> {
    client.import_session(session_cache::Session {
        cookies: String::new(),
        view_state: String::new(),
        expires_at: 0,
        login_timestamp: 0,
    });
    login_fresh(client, account, &job.operation_id, login_deps).await?;
    let result = with_session_retry(
        client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<upstream_client::LoadPackagesResult>> + Send + '_>> {
            c.load_packages(&job.card_number, &job.smartcard_type)
        },
        |r: &upstream_client::LoadPackagesResult| {
            r.error
                .as_deref()
                .map(upstream_client::UpstreamError::looks_like_session_expired)
                .unwrap_or(false)
        },
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, login_deps))
        },
    )
    .await?;
    if !result.success {
        return Err(JobProcessorError::UpstreamTransient(
            result.error.unwrap_or_else(|| "load_packages failed during fail-over".into()),
        ));
    }
    Ok(result.dealer_balance)
}

fn classify_retry(err: &JobProcessorError) -> bool {
    matches!(
        err,
        JobProcessorError::SessionExpired
            | JobProcessorError::CaptchaRequired
            | JobProcessorError::LoginFailed(_)
            | JobProcessorError::UpstreamTransient(_)
            | JobProcessorError::InsufficientDealerBalance
    )
}
