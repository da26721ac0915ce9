//! `SIGNAL_CHECK` / `SIGNAL_ACTIVATE` / `SIGNAL_REFRESH` (§4.6): checking
//! and activating a card's TV signal. `SIGNAL_CHECK` pauses at a
//! `COMPLETED` row carrying `awaiting_activate=true` rather than a
//! dedicated intermediate status (see DESIGN.md); `SIGNAL_ACTIVATE`
//! resumes that same row, and `SIGNAL_REFRESH` does both in one pass via
//! the upstream client's combined `activate_signal` call.

use super::{mark_processing, now_ts};
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
use tracing::info;
use upstream_client::{SignalResult, UpstreamClient};
use worker_db::{queries, DealerAccount, OperationStatus, ResponseData};

const QUEUE_TIMEOUT: Duration = Duration::from_secs(120);
const ACCOUNT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const ACCOUNT_LOCK_POLL: Duration = Duration::from_secs(1);
const SNAPSHOT_MAX_AGE_SECS: i64 = 30 * 60;

pub async fn handle_check<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
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
        job.amount,
        run_check(ctx, job),
    )
    .await
}

async fn run_check<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
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

    let result = do_check(ctx, job, &account).await;

    heartbeat.stop();
    let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
    result
}

async fn do_check<C, F>(ctx: &JobContext<C, F>, job: &Job, account: &DealerAccount) -> JobProcessorResult<()>
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

    let result: SignalResult = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<SignalResult>> + Send + '_>> {
            c.check_card_for_signal(&job.card_number)
        },
        |r: &SignalResult| !r.success && upstream_client::UpstreamError::looks_like_session_expired(&r.message),
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, &login_deps))
        },
    )
    .await?;
    if !result.success {
        return Err(JobProcessorError::UpstreamTransient(result.message));
    }

    persist_signal_result(ctx, job, &*client, &account.id, &result, true).await
}

pub async fn handle_activate<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let op = {
        let conn = ctx.db.get()?;
        queries::get_operation(&conn, &job.operation_id)?
            .ok_or_else(|| JobProcessorError::InvariantViolation("operation missing at dispatch".into()))?
    };
    let (card_status, contracts, session, checked_at) = match (&op.status, &op.response_data) {
        (
            OperationStatus::Completed,
            Some(ResponseData::SignalCheckSnapshot { card_status, contracts, session, checked_at, awaiting_activate: true }),
        ) => (card_status.clone(), contracts.clone(), session.clone(), *checked_at),
        _ => return Err(JobProcessorError::DuplicateDelivery),
    };
    let account_id = op
        .account_id
        .clone()
        .ok_or_else(|| JobProcessorError::InvariantViolation("no account recorded on the signal-check snapshot".into()))?;

    run_handler(
        &ctx.db,
        ctx.ledger.as_ref(),
        &job.operation_id,
        &job.user_id,
        job.amount,
        run_activate(ctx, job, &account_id, session, checked_at, card_status, contracts),
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_activate<C, F>(
    ctx: &JobContext<C, F>,
    job: &Job,
    account_id: &str,
    session: serde_json::Value,
    checked_at: i64,
    fallback_card_status: serde_json::Value,
    fallback_contracts: serde_json::Value,
) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    if now_ts() - checked_at > SNAPSHOT_MAX_AGE_SECS {
        return Err(JobProcessorError::SessionExpired);
    }

    check_cancelled(&ctx.db, &job.operation_id).await?;
    let account = ctx
        .account_pool
        .acquire_specific(account_id, &ctx.worker_id, ACCOUNT_LOCK_TIMEOUT, ACCOUNT_LOCK_POLL)
        .await?
        .ok_or_else(|| JobProcessorError::NoAvailableAccounts(format!("could not lock account {account_id} for signal activation")))?;

    let result = activate(ctx, job, &account, session, fallback_card_status, fallback_contracts).await;
    let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
    result
}

async fn activate<C, F>(
    ctx: &JobContext<C, F>,
    job: &Job,
    account: &DealerAccount,
    session: serde_json::Value,
    fallback_card_status: serde_json::Value,
    fallback_contracts: serde_json::Value,
) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let account_id = account.id.as_str();
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

    let result: SignalResult = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<SignalResult>> + Send + '_>> {
            c.activate_signal_only(&job.card_number)
        },
        |r: &SignalResult| !r.success && upstream_client::UpstreamError::looks_like_session_expired(&r.message),
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, &login_deps))
        },
    )
    .await?;
    if !result.success {
        return Err(JobProcessorError::UpstreamTransient(result.message));
    }

    let merged = SignalResult {
        success: true,
        card_status: if result.card_status.is_null() { fallback_card_status } else { result.card_status.clone() },
        contracts: if result.contracts.is_null() { fallback_contracts } else { result.contracts.clone() },
        message: result.message.clone(),
    };
    persist_signal_result(ctx, job, &*client, account_id, &merged, false).await
}

pub async fn handle_refresh<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
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
        job.amount,
        run_refresh(ctx, job),
    )
    .await
}

async fn run_refresh<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
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

    let result = do_refresh(ctx, job, &account).await;

    heartbeat.stop();
    let _ = ctx.account_pool.release(&account.id, &ctx.worker_id).await;
    result
}

async fn do_refresh<C, F>(ctx: &JobContext<C, F>, job: &Job, account: &DealerAccount) -> JobProcessorResult<()>
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

    let result: SignalResult = with_session_retry(
        &mut *client,
        |c: &mut C| -> Pin<Box<dyn Future<Output = upstream_client::UpstreamResult<SignalResult>> + Send + '_>> {
            c.activate_signal(&job.card_number)
        },
        |r: &SignalResult| !r.success && upstream_client::UpstreamError::looks_like_session_expired(&r.message),
        |c: &mut C| -> Pin<Box<dyn Future<Output = JobProcessorResult<()>> + Send + '_>> {
            Box::pin(login_fresh(c, account, &job.operation_id, &login_deps))
        },
    )
    .await?;
    if !result.success {
        return Err(JobProcessorError::UpstreamTransient(result.message));
    }

    persist_signal_result(ctx, job, &*client, &account.id, &result, false).await
}

async fn persist_signal_result<C: UpstreamClient, F>(
    ctx: &JobContext<C, F>,
    job: &Job,
    client: &C,
    account_id: &str,
    result: &SignalResult,
    awaiting_activate: bool,
) -> JobProcessorResult<()>
where
    F: Fn() -> C + Send + Sync,
{
    let session = client
        .export_session()
        .ok_or_else(|| JobProcessorError::InvariantViolation("no session to snapshot after signal call".into()))?;
    let now = now_ts();
    let response_data = ResponseData::SignalCheckSnapshot {
        card_status: result.card_status.clone(),
        contracts: result.contracts.clone(),
        session: serde_json::to_value(&session)?,
        checked_at: now,
        awaiting_activate,
    };

    let conn = ctx.db.get()?;
    let current = queries::get_operation(&conn, &job.operation_id)?
        .ok_or_else(|| JobProcessorError::InvariantViolation("operation vanished mid-signal-call".into()))?;
    let updated = queries::update_operation_if(
        &conn,
        &job.operation_id,
        current.status,
        OperationStatus::Completed,
        Some(account_id),
        None,
        Some(&response_data),
        Some(&result.message),
        None,
        None,
        if awaiting_activate { None } else { Some(now) },
        now,
    )?;
    drop(conn);
    if !updated {
        return Err(JobProcessorError::DuplicateDelivery);
    }

    if !awaiting_activate {
        ctx.account_pool.mark_used(account_id).await?;
        ctx.notifier
            .notify_user(&job.user_id, "Your signal has been activated.")
            .await;
    }
    info!(operation_id = %job.operation_id, %account_id, awaiting_activate, "signal operation completed");
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
    use worker_db::{queries as q, DatabasePool, DealerAccount, Operation, OperationType, PoolConfig};

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

    fn seed_operation(db: &DatabasePool, id: &str, op_type: OperationType, status: OperationStatus, response_data: Option<ResponseData>) {
        let conn = db.get().unwrap();
        q::insert_operation(
            &conn,
            &Operation {
                id: id.into(),
                user_id: "u1".into(),
                op_type,
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
                final_confirm_expiry: None,
                completed_at: None,
                created_at: 0,
                updated_at: 0,
            },
        )
        .unwrap();
    }

    fn sample_job(operation_id: &str, op_type: OperationType) -> Job {
        Job {
            operation_id: operation_id.into(),
            op_type,
            card_number: "1234567890".into(),
            duration: None,
            promo_code: None,
            user_id: "u1".into(),
            amount: 0.0,
            account_id: Some("acc-1".into()),
            smartcard_type: "CISCO".into(),
        }
    }

    #[tokio::test]
    async fn signal_check_persists_completed_awaiting_activate() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let db = Arc::new(DatabasePool::open(&dir.join("sig1.db"), PoolConfig::default()).unwrap());
        seed_account(&db, "acc-1");
        seed_operation(&db, "op1", OperationType::SignalCheck, OperationStatus::Pending, None);

        let store: Arc<dyn session_cache::SharedStore> = Arc::new(MemoryStore::new());
        let ctx = JobContext::new(
            Arc::clone(&db),
            store,
            ScriptedUpstreamClient::new,
            Arc::new(InMemoryLedger::new()),
            Arc::new(RecordingNotifier::new()),
            None,
            &test_config(),
        );
        {
            let handle = ctx.clients.get_or_create("acc-1");
            let mut client = handle.lock().await;
            client.queue_login(Ok(LoginResult::success()));
            client.queue_signal(Ok(SignalResult {
                success: true,
                card_status: json!({"active": true}),
                contracts: json!([]),
                message: "checked".into(),
            }));
        }

        let job = sample_job("op1", OperationType::SignalCheck);
        handle_check(&ctx, &job).await.unwrap();

        let op = q::get_operation(&db.get().unwrap(), "op1").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        match op.response_data {
            Some(ResponseData::SignalCheckSnapshot { awaiting_activate, .. }) => assert!(awaiting_activate),
            other => panic!("unexpected response_data: {other:?}"),
        }
    }

    #[tokio::test]
    async fn signal_activate_resumes_from_the_check_snapshot() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let db = Arc::new(DatabasePool::open(&dir.join("sig2.db"), PoolConfig::default()).unwrap());
        seed_account(&db, "acc-1");
        let snapshot = ResponseData::SignalCheckSnapshot {
            card_status: json!({"active": true}),
            contracts: json!([]),
            session: serde_json::to_value(session_cache::Session {
                cookies: "c".into(),
                view_state: "v".into(),
                expires_at: now_ts() + 1000,
                login_timestamp: now_ts(),
            })
            .unwrap(),
            checked_at: now_ts(),
            awaiting_activate: true,
        };
        seed_operation(&db, "op2", OperationType::SignalActivate, OperationStatus::Completed, Some(snapshot));

        let store: Arc<dyn session_cache::SharedStore> = Arc::new(MemoryStore::new());
        let ctx = JobContext::new(
            Arc::clone(&db),
            store,
            ScriptedUpstreamClient::new,
            Arc::new(InMemoryLedger::new()),
            Arc::new(RecordingNotifier::new()),
            None,
            &test_config(),
        );
        {
            let handle = ctx.clients.get_or_create("acc-1");
            let mut client = handle.lock().await;
            client.queue_signal(Ok(SignalResult {
                success: true,
                card_status: json!(null),
                contracts: json!(null),
                message: "activated".into(),
            }));
        }

        let job = sample_job("op2", OperationType::SignalActivate);
        handle_activate(&ctx, &job).await.unwrap();

        let op = q::get_operation(&db.get().unwrap(), "op2").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(op.completed_at.is_some());
        match op.response_data {
            Some(ResponseData::SignalCheckSnapshot { awaiting_activate, .. }) => assert!(!awaiting_activate),
            other => panic!("unexpected response_data: {other:?}"),
        }
    }
}
