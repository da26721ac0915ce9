//! `START_INSTALLMENT` / `CONFIRM_INSTALLMENT` (§4.6): same shape as
//! `START_RENEWAL` + `CONFIRM_PURCHASE`, except the user's ledger is
//! never touched until `pay_installment` actually succeeds (P7) — the
//! operation's `amount` is pinned at `0` the whole time it sits at
//! `AWAITING_FINAL_CONFIRM`, and the real debit happens only on the
//! `CONFIRM_INSTALLMENT` success path.

use super::{mark_processing, now_ts};
use crate::context::JobContext;
use crate::dispatch::{check_cancelled, run_handler, LeaseHeartbeat};
use crate::error::{JobProcessorError, JobProcessorResult};
use crate::job::Job;
use crate::login::{ensure_session, login_fresh, LoginDeps};
use crate::session_retry::with_session_retry;
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use upstream_client::{InstallmentResult, PayInstallmentResult, UpstreamClient};
use worker_db::{queries, DealerAccount, Operation, OperationStatus, ResponseData};

const QUEUE_TIMEOUT: Duration = Duration::from_secs(120);
const FINAL_CONFIRM_WINDOW_SECS: i64 = 60;
const ACCOUNT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const ACCOUNT_LOCK_POLL: Duration = Duration::from_secs(1);
const SNAPSHOT_MAX_AGE_SECS: i64 = 30 * 60;

pub async fn handle_start<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
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
        run_start(ctx, job),
    )
    .await
}

async fn run_start<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
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

    let result = do_start(ctx, job, &account).await;

    heartbeat.stop();
    let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
    result
}

async fn do_start<C, F>(ctx: &JobContext<C, F>, job: &Job, account: &DealerAccount) -> JobProcessorResult<()>
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

    let result: InstallmentResult = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<InstallmentResult>> + Send + '_>> {
            c.load_installment(&job.card_number)
        },
        |_: &InstallmentResult| false,
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, &login_deps))
        },
    )
    .await?;

    let now = now_ts();
    let conn = ctx.db.get()?;
    let current = queries::get_operation(&conn, &job.operation_id)?
        .ok_or_else(|| JobProcessorError::InvariantViolation("operation vanished before installment snapshot write".into()))?;

    if !result.exists {
        let response_data = ResponseData::InstallmentSnapshot {
            installment: serde_json::Value::Null,
            subscriber: serde_json::Value::Null,
            dealer_balance: result.dealer_balance,
            is_installment: true,
        };
        let updated = queries::update_operation_if(
            &conn,
            &job.operation_id,
            current.status,
            OperationStatus::Completed,
            Some(&account.id),
            Some(0.0),
            Some(&response_data),
            Some("no installment plan found for this card"),
            None,
            None,
            Some(now),
            now,
        )?;
        drop(conn);
        if !updated {
            return Err(JobProcessorError::DuplicateDelivery);
        }
        ctx.notifier
            .notify_user(&job.user_id, "No installment plan was found for this card.")
            .await;
        info!(operation_id = %job.operation_id, "no installment plan found, operation completed");
        return Ok(());
    }

    let session = client
        .export_session()
        .ok_or_else(|| JobProcessorError::InvariantViolation("no session to snapshot after load_installment".into()))?;
    let response_data = ResponseData::AwaitingFinalConfirmSnapshot {
        session: serde_json::to_value(&session)?,
        dealer_balance: result.dealer_balance,
        saved_at: now,
        is_installment: true,
    };
    let updated = queries::update_operation_if(
        &conn,
        &job.operation_id,
        current.status,
        OperationStatus::AwaitingFinalConfirm,
        Some(&account.id),
        Some(0.0),
        Some(&response_data),
        None,
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
        .notify_user(&job.user_id, "An installment plan is available, please confirm within 60 seconds.")
        .await;
    info!(operation_id = %job.operation_id, account_id = %account.id, "installment plan found, awaiting user confirmation");
    Ok(())
}

pub async fn handle_confirm<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
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
        return Err(JobProcessorError::DuplicateDelivery);
    }
    if let Some(expiry) = op.final_confirm_expiry {
        if now_ts() > expiry {
            // `op.amount` (not a hardcoded `0`): a prior delivery may have
            // already debited the ledger and crashed before the final write,
            // in which case this freshly-read column is what carries that
            // amount forward so the timeout path still refunds it.
            return run_handler(
                &ctx.db,
                ctx.ledger.as_ref(),
                &job.operation_id,
                &job.user_id,
                op.amount,
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
            // Completing; don't re-run the upstream pay call.
            return Err(JobProcessorError::DuplicateDelivery);
        }
    }

    // `confirm` only ever debits the ledger once it has a successful pay
    // response in hand; this records the actual amount taken so a failure
    // afterwards (e.g. the final status write) refunds what was really
    // debited rather than the `0` the operation's `amount` column still
    // carries from `START_INSTALLMENT`.
    let debited = Cell::new(0.0f64);
    let result = run_confirm(ctx, job, &op, &debited).await;
    run_handler(
        &ctx.db,
        ctx.ledger.as_ref(),
        &job.operation_id,
        &job.user_id,
        debited.get(),
        async { result },
    )
    .await
}

async fn run_confirm<C, F>(ctx: &JobContext<C, F>, job: &Job, op: &Operation, debited: &Cell<f64>) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let account_id = op
        .account_id
        .clone()
        .ok_or_else(|| JobProcessorError::InvariantViolation("no account assigned before CONFIRM_INSTALLMENT".into()))?;

    check_cancelled(&ctx.db, &job.operation_id).await?;

    let account = ctx
        .account_pool
        .acquire_specific(&account_id, &ctx.worker_id, ACCOUNT_LOCK_TIMEOUT, ACCOUNT_LOCK_POLL)
        .await?
        .ok_or_else(|| JobProcessorError::NoAvailableAccounts(format!("could not lock account {account_id} for installment confirmation")))?;

    let result = confirm(ctx, job, op, &account, debited).await;
    let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
    result
}

async fn confirm<C, F>(ctx: &JobContext<C, F>, job: &Job, op: &Operation, account: &DealerAccount, debited: &Cell<f64>) -> JobProcessorResult<()>
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

    // Re-load the installment page to get a fresh view-state before paying.
    let reloaded: InstallmentResult = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<InstallmentResult>> + Send + '_>> {
            c.load_installment(&job.card_number)
        },
        |_: &InstallmentResult| false,
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, &login_deps))
        },
    )
    .await?;
    if !reloaded.exists {
        return Err(JobProcessorError::UpstreamTransient(
            "installment plan was no longer available at confirmation time".into(),
        ));
    }

    check_cancelled(&ctx.db, &job.operation_id).await?;

    let result: PayInstallmentResult = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<PayInstallmentResult>> + Send + '_>> {
            c.pay_installment()
        },
        |r: &PayInstallmentResult| !r.success && upstream_client::UpstreamError::looks_like_session_expired(&r.message),
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, &login_deps))
        },
    )
    .await?;
    if !result.success {
        return Err(JobProcessorError::UpstreamTransient(result.message));
    }

    ctx.ledger.debit(&job.user_id, &job.operation_id, job.amount).await?;
    debited.set(job.amount);

    let now = now_ts();
    let conn = ctx.db.get()?;
    let current = queries::get_operation(&conn, &job.operation_id)?
        .ok_or_else(|| JobProcessorError::InvariantViolation("operation vanished mid-installment-confirmation".into()))?;
    let updated = queries::update_operation_if(
        &conn,
        &job.operation_id,
        current.status,
        OperationStatus::Completed,
        None,
        Some(job.amount),
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
        .notify_user(&job.user_id, "Your installment payment is confirmed.")
        .await;
    info!(operation_id = %job.operation_id, %account_id, "installment payment confirmed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobContext;
    use ledger_core::InMemoryLedger;
    use notify_adapter::RecordingNotifier;
    use serde_json::json;
    use session_cache::MemoryStore;
    use std::sync::Arc;
    use upstream_client::{LoginResult, ScriptedUpstreamClient};
    use worker_core::Config;
    use worker_db::{queries as q, DatabasePool, DealerAccount, OperationType, PoolConfig};

    fn test_config() -> Config {
        Config {
            database_url: "sqlite://test".into(),
            shared_store_url: "redis://test".into(),
            worker_id: "worker-1".into(),
            worker_concurrency: 3,
            worker_rate_limit_per_minute: 30,
            pre_login_timeout_secs: 120,
            keepalive_interval_minutes: 19,
            captcha_timeout_secs: 1,
            captcha_2captcha_key: None,
            db_pool_max_size: 10,
            log_level: "info".into(),
        }
    }

    fn seed_account(db: &DatabasePool, id: &str) {
        let conn = db.get().unwrap();
        q::insert_dealer_account(
            &conn,
            &DealerAccount {
                id: id.into(),
                username: "u".into(),
                password: "p".into(),
                totp_seed: None,
                proxy_id: None,
                active: true,
                priority: 0,
                last_known_balance: Some(500.0),
                balance_updated_at: None,
                cooldown_until: 0,
                fail_reason: None,
                last_used_at: 0,
            },
        )
        .unwrap();
    }

    fn seed_operation(db: &DatabasePool, id: &str, status: OperationStatus, response_data: Option<ResponseData>, expiry: Option<i64>) {
        let conn = db.get().unwrap();
        q::insert_operation(
            &conn,
            &Operation {
                id: id.into(),
                user_id: "u1".into(),
                op_type: OperationType::StartInstallment,
                status,
                card_number: "1234567890".into(),
                account_id: Some("acc-1".into()),
                amount: 0.0,
                selected_package: None,
                stb_number: None,
                captcha_image: None,
                captcha_solution: None,
                response_data,
                response_message: None,
                heartbeat_at: None,
                heartbeat_expiry: None,
                final_confirm_expiry: expiry,
                completed_at: None,
                created_at: 0,
                updated_at: 0,
            },
        )
        .unwrap();
    }

    fn sample_job(operation_id: &str, amount: f64) -> Job {
        Job {
            operation_id: operation_id.into(),
            op_type: OperationType::StartInstallment,
            card_number: "1234567890".into(),
            duration: None,
            promo_code: None,
            user_id: "u1".into(),
            amount,
            account_id: Some("acc-1".into()),
            smartcard_type: "CISCO".into(),
        }
    }

    #[tokio::test]
    async fn start_installment_with_no_plan_completes_without_charging() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let db = Arc::new(DatabasePool::open(&dir.join("inst1.db"), PoolConfig::default()).unwrap());
        seed_account(&db, "acc-1");
        seed_operation(&db, "op1", OperationStatus::Pending, None, None);

        let store: Arc<dyn session_cache::SharedStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::with_balance("u1", 0.0));
        let ctx = JobContext::new(
            Arc::clone(&db),
            store,
            ScriptedUpstreamClient::new,
            Arc::clone(&ledger) as Arc<dyn ledger_core::Ledger>,
            Arc::new(RecordingNotifier::new()),
            None,
            &test_config(),
        );
        {
            let handle = ctx.clients.get_or_create("acc-1");
            let mut client = handle.lock().await;
            client.queue_login(Ok(LoginResult::success()));
            client.queue_installment(Ok(InstallmentResult { exists: false, installment: None, subscriber: None, dealer_balance: Some(400.0) }));
        }

        let job = sample_job("op1", 75.0);
        handle_start(&ctx, &job).await.unwrap();

        let op = q::get_operation(&db.get().unwrap(), "op1").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.amount, 0.0);
        assert_eq!(ledger.balance("u1").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn confirm_installment_debits_only_after_payment_succeeds() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let db = Arc::new(DatabasePool::open(&dir.join("inst2.db"), PoolConfig::default()).unwrap());
        seed_account(&db, "acc-1");
        let snapshot = ResponseData::AwaitingFinalConfirmSnapshot {
            session: serde_json::to_value(session_cache::Session {
                cookies: "c".into(),
                view_state: "v".into(),
                expires_at: now_ts() + 1000,
                login_timestamp: now_ts(),
            })
            .unwrap(),
            dealer_balance: Some(400.0),
            saved_at: now_ts(),
            is_installment: true,
        };
        seed_operation(&db, "op2", OperationStatus::AwaitingFinalConfirm, Some(snapshot), Some(now_ts() + 60));

        let store: Arc<dyn session_cache::SharedStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::with_balance("u1", 0.0));
        let ctx = JobContext::new(
            Arc::clone(&db),
            store,
            ScriptedUpstreamClient::new,
            Arc::clone(&ledger) as Arc<dyn ledger_core::Ledger>,
            Arc::new(RecordingNotifier::new()),
            None,
            &test_config(),
        );
        {
            let handle = ctx.clients.get_or_create("acc-1");
            let mut client = handle.lock().await;
            client.queue_installment(Ok(InstallmentResult {
                exists: true,
                installment: Some(json!({"due": 75.0})),
                subscriber: Some(json!({"id": "s1"})),
                dealer_balance: Some(400.0),
            }));
            client.queue_pay_installment(Ok(PayInstallmentResult { success: true, message: "paid".into() }));
        }

        let job = sample_job("op2", 75.0);
        handle_confirm(&ctx, &job).await.unwrap();

        let op = q::get_operation(&db.get().unwrap(), "op2").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.amount, 75.0);
        assert_eq!(ledger.balance("u1").await.unwrap(), -75.0);
    }
}
