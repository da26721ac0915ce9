//! Session establishment and the login/CAPTCHA flow (§4.6 `START_RENEWAL`
//! steps 2-3, and the "Re-login" clause of the session-retry wrapper).
//!
//! Kept independent of [`crate::context::JobContext`]'s client-factory
//! generic: handlers already hold a borrowed client, so these functions
//! take it directly plus a small [`LoginDeps`] bundle.

use crate::captcha::{CaptchaSolver, CAPTCHA_POLL_INTERVAL};
use crate::error::{JobProcessorError, JobProcessorResult};
use session_cache::SessionCache;
use std::time::Duration;
use tracing::{info, warn};
use upstream_client::UpstreamClient;
use worker_db::{queries, DatabasePool, DealerAccount, OperationStatus};

/// The TTL re-exported sessions are cached with on successful login, per
/// §4.6's "fresh `expiresAt = now + 15 min`".
const SESSION_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// How long a worker waits on another worker's in-flight login before
/// giving up and logging in itself.
const LOGIN_LOCK_WAIT: Duration = Duration::from_secs(30);
/// Heartbeat slack attached to an `AWAITING_CAPTCHA` pause so the
/// operation doesn't look abandoned to an external watchdog mid-wait.
const CAPTCHA_HEARTBEAT_SLACK: Duration = Duration::from_secs(15);

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct LoginDeps<'a> {
    pub session_cache: &'a SessionCache,
    pub db: &'a DatabasePool,
    pub captcha_solver: Option<&'a dyn CaptchaSolver>,
    pub worker_id: &'a str,
    pub captcha_timeout: Duration,
}

/// Make sure `client` holds a valid session for `account`, restoring from
/// cache or logging in fresh as needed (§4.6 `START_RENEWAL` step 2).
pub async fn ensure_session<C: UpstreamClient>(
    client: &mut C,
    account: &DealerAccount,
    operation_id: &str,
    deps: &LoginDeps<'_>,
) -> JobProcessorResult<()> {
    if !client.is_session_active() {
        if let Some(session) = deps.session_cache.get(&account.id).await? {
            client.import_session(session);
        }
    }

    if client.is_session_active() && client.validate_session().await? {
        return Ok(());
    }

    if client.is_session_active() {
        deps.session_cache.delete(&account.id).await?;
    }

    login_fresh(client, account, operation_id, deps).await
}

/// §4.6 `START_RENEWAL` step 3: single-flight login coordination plus the
/// actual login/CAPTCHA exchange.
pub async fn login_fresh<C: UpstreamClient>(
    client: &mut C,
    account: &DealerAccount,
    operation_id: &str,
    deps: &LoginDeps<'_>,
) -> JobProcessorResult<()> {
    let mut owns_lock = deps
        .session_cache
        .acquire_login_lock(&account.id, deps.worker_id)
        .await?;

    if !owns_lock {
        let cleared = deps
            .session_cache
            .wait_for_login_complete(&account.id, LOGIN_LOCK_WAIT)
            .await?;
        if cleared {
            if let Some(session) = deps.session_cache.get(&account.id).await? {
                client.import_session(session);
                if client.validate_session().await? {
                    return Ok(());
                }
                deps.session_cache.delete(&account.id).await?;
            }
        }
        // Whoever held the lock didn't leave us a usable session; log in
        // ourselves, taking the lock if it's now free.
        owns_lock = deps
            .session_cache
            .acquire_login_lock(&account.id, deps.worker_id)
            .await?;
    }

    let result = do_login(client, account, operation_id, deps).await;

    if owns_lock {
        deps.session_cache.release_login_lock(&account.id, deps.worker_id).await?;
    }

    result
}

async fn do_login<C: UpstreamClient>(
    client: &mut C,
    account: &DealerAccount,
    operation_id: &str,
    deps: &LoginDeps<'_>,
) -> JobProcessorResult<()> {
    let login = client
        .login(&account.username, &account.password, account.totp_seed.as_deref())
        .await?;

    if login.success {
        return cache_session(client, account, deps).await;
    }

    if login.requires_captcha {
        let image = login.captcha_image.clone().unwrap_or_default();
        let solution = resolve_captcha(&image, operation_id, deps).await?;
        let submitted = client
            .submit_login(&account.username, &account.password, account.totp_seed.as_deref(), &solution)
            .await?;
        if !submitted.success {
            return Err(JobProcessorError::LoginFailed(
                submitted.error.unwrap_or_else(|| "captcha submission rejected".into()),
            ));
        }
        return cache_session(client, account, deps).await;
    }

    Err(JobProcessorError::LoginFailed(
        login.error.unwrap_or_else(|| "login failed with no reason given".into()),
    ))
}

async fn cache_session<C: UpstreamClient>(
    client: &C,
    account: &DealerAccount,
    deps: &LoginDeps<'_>,
) -> JobProcessorResult<()> {
    let session = client
        .export_session()
        .ok_or_else(|| JobProcessorError::InvariantViolation("login succeeded but no session was exported".into()))?;
    deps.session_cache.put(&account.id, &session, SESSION_CACHE_TTL).await?;
    info!(account_id = %account.id, "cached fresh upstream session");
    Ok(())
}

/// §4.6: auto-solve via the external solver when configured, otherwise
/// pause the operation to `AWAITING_CAPTCHA` and poll for a human answer.
async fn resolve_captcha(
    image: &str,
    operation_id: &str,
    deps: &LoginDeps<'_>,
) -> JobProcessorResult<String> {
    if let Some(solver) = deps.captcha_solver {
        return solver
            .solve(image)
            .await
            .map_err(|err| JobProcessorError::LoginFailed(format!("captcha solve failed: {err}")));
    }
    pause_for_captcha(image, operation_id, deps).await
}

async fn pause_for_captcha(
    image: &str,
    operation_id: &str,
    deps: &LoginDeps<'_>,
) -> JobProcessorResult<String> {
    let now = now_ts();
    let heartbeat_expiry = now + CAPTCHA_HEARTBEAT_SLACK.as_secs() as i64;

    {
        let conn = deps.db.get()?;
        let current = queries::get_operation(&conn, operation_id)?
            .ok_or_else(|| JobProcessorError::InvariantViolation("operation vanished before captcha pause".into()))?;
        queries::set_awaiting_captcha(&conn, operation_id, current.status, image, heartbeat_expiry, now)?;
    }
    warn!(%operation_id, "paused for human captcha solution");

    let deadline = tokio::time::Instant::now() + deps.captcha_timeout;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(JobProcessorError::CaptchaRequired);
        }
        let solution = {
            let conn = deps.db.get()?;
            queries::get_captcha_solution(&conn, operation_id)?
        };
        if let Some(solution) = solution {
            let conn = deps.db.get()?;
            queries::clear_captcha_fields(&conn, operation_id)?;
            return Ok(solution);
        }
        tokio::time::sleep(CAPTCHA_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_cache::MemoryStore;
    use std::sync::Arc;
    use upstream_client::{LoginResult, ScriptedUpstreamClient};
    use worker_db::{queries as q, Operation, OperationType, PoolConfig, ResponseData};

    fn test_db() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap().into_path();
        DatabasePool::open(&dir.join("login_test.db"), PoolConfig::default()).unwrap()
    }

    fn sample_account() -> DealerAccount {
        DealerAccount {
            id: "a1".into(),
            username: "user".into(),
            password: "pass".into(),
            totp_seed: None,
            proxy_id: None,
            active: true,
            priority: 0,
            last_known_balance: Some(100.0),
            balance_updated_at: None,
            cooldown_until: 0,
            fail_reason: None,
            last_used_at: 0,
        }
    }

    fn sample_operation(id: &str) -> Operation {
        Operation {
            id: id.into(),
            user_id: "u1".into(),
            op_type: OperationType::StartRenewal,
            status: OperationStatus::Processing,
            card_number: "1234567890".into(),
            account_id: Some("a1".into()),
            amount: 0.0,
            selected_package: None,
            stb_number: None,
            captcha_image: None,
            captcha_solution: None,
            response_data: None::<ResponseData>,
            response_message: None,
            heartbeat_at: None,
            heartbeat_expiry: None,
            final_confirm_expiry: None,
            completed_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn ensure_session_logs_in_fresh_when_cache_is_empty() {
        let db = test_db();
        {
            let conn = db.get().unwrap();
            q::insert_operation(&conn, &sample_operation("op1")).unwrap();
        }
        let session_cache = SessionCache::new(Arc::new(MemoryStore::new()));
        let deps = LoginDeps {
            session_cache: &session_cache,
            db: &db,
            captcha_solver: None,
            worker_id: "worker-1",
            captcha_timeout: Duration::from_secs(1),
        };
        let mut client = ScriptedUpstreamClient::new();
        client.queue_login(Ok(LoginResult::success()));

        ensure_session(&mut client, &sample_account(), "op1", &deps).await.unwrap();
        assert!(client.is_session_active());
        assert!(session_cache.get("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ensure_session_reuses_a_still_valid_cached_session() {
        let db = test_db();
        let session_cache = SessionCache::new(Arc::new(MemoryStore::new()));
        session_cache
            .put(
                "a1",
                &session_cache::Session {
                    cookies: "c".into(),
                    view_state: "v".into(),
                    expires_at: now_ts() + 1000,
                    login_timestamp: now_ts(),
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let deps = LoginDeps {
            session_cache: &session_cache,
            db: &db,
            captcha_solver: None,
            worker_id: "worker-1",
            captcha_timeout: Duration::from_secs(1),
        };
        let mut client = ScriptedUpstreamClient::new();
        client.queue_validate_session(Ok(true));

        ensure_session(&mut client, &sample_account(), "op1", &deps).await.unwrap();
        assert!(client.is_session_active());
    }

    #[tokio::test]
    async fn login_fresh_pauses_for_captcha_and_resumes_once_solved() {
        let db = Arc::new(test_db());
        {
            let conn = db.get().unwrap();
            q::insert_operation(&conn, &sample_operation("op-captcha")).unwrap();
        }
        let session_cache = SessionCache::new(Arc::new(MemoryStore::new()));
        let deps = LoginDeps {
            session_cache: &session_cache,
            db: &db,
            captcha_solver: None,
            worker_id: "worker-1",
            captcha_timeout: Duration::from_secs(5),
        };
        let mut client = ScriptedUpstreamClient::new();
        client.queue_login(Ok(LoginResult::captcha_required("img-data")));
        client.queue_login(Ok(LoginResult::success()));

        let solver_task = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let conn = db.get().unwrap();
                q::set_captcha_solution(&conn, "op-captcha", "SOLVED").unwrap();
            })
        };

        login_fresh(&mut client, &sample_account(), "op-captcha", &deps).await.unwrap();
        solver_task.await.unwrap();
        assert!(client.is_session_active());
    }

    #[tokio::test]
    async fn login_fresh_fails_loudly_when_captcha_times_out() {
        let db = test_db();
        {
            let conn = db.get().unwrap();
            q::insert_operation(&conn, &sample_operation("op-timeout")).unwrap();
        }
        let session_cache = SessionCache::new(Arc::new(MemoryStore::new()));
        let deps = LoginDeps {
            session_cache: &session_cache,
            db: &db,
            captcha_solver: None,
            worker_id: "worker-1",
            captcha_timeout: Duration::from_millis(50),
        };
        let mut client = ScriptedUpstreamClient::new();
        client.queue_login(Ok(LoginResult::captcha_required("img-data")));

        let err = login_fresh(&mut client, &sample_account(), "op-timeout", &deps)
            .await
            .unwrap_err();
        assert!(matches!(err, JobProcessorError::CaptchaRequired));
    }
}
