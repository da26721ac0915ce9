//! [`KeepAliveService`]: the staggered background refresh cycle (§4.7).
//!
//! Shares the session cache, account pool, and client registry with the
//! job-processor workers, but runs as its own long-lived task: every
//! `interval`, it walks the active account directory in priority order
//! and, ~10 s apart per account, makes sure each one still has a valid
//! upstream session — skipping any account a job is actively leasing.

use crate::metrics::{CycleStats, RefreshOutcome};
use account_pool::AccountPool;
use job_processor::captcha::CaptchaSolver;
use job_processor::client_registry::ClientRegistry;
use job_processor::{JobProcessorError, JobProcessorResult};
use session_cache::{SessionCache, SharedStore, DEFAULT_SESSION_TTL};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use upstream_client::UpstreamClient;
use worker_core::Config;
use worker_db::{DatabasePool, DealerAccount};

/// Stagger between accounts within one cycle (§4.7): spreads login/
/// validate traffic out so a fleet-wide cycle never looks like a
/// synchronized request storm to upstream.
pub const DEFAULT_STAGGER: Duration = Duration::from_secs(10);

/// Dealer balance floor below which [`notify_adapter::Notifier::notify_low_balance`] fires.
pub const LOW_BALANCE_THRESHOLD: f64 = 50.0;

const LOGIN_LOCK_WAIT: Duration = Duration::from_secs(30);

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct KeepAliveService<C, F>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    db: Arc<DatabasePool>,
    store: Arc<dyn SharedStore>,
    session_cache: SessionCache,
    account_pool: Arc<AccountPool>,
    clients: ClientRegistry<C, F>,
    notifier: Arc<dyn notify_adapter::Notifier>,
    captcha_solver: Option<Arc<dyn CaptchaSolver>>,
    worker_id: String,
    interval: Duration,
    stagger: Duration,
    captcha_timeout: Duration,
    low_balance_threshold: f64,
    running: Arc<AtomicBool>,
}

impl<C, F> KeepAliveService<C, F>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabasePool>,
        store: Arc<dyn SharedStore>,
        account_pool: Arc<AccountPool>,
        client_factory: F,
        notifier: Arc<dyn notify_adapter::Notifier>,
        captcha_solver: Option<Arc<dyn CaptchaSolver>>,
        config: &Config,
    ) -> Self {
        Self {
            session_cache: SessionCache::new(Arc::clone(&store)),
            db,
            store,
            account_pool,
            clients: ClientRegistry::new(client_factory),
            notifier,
            captcha_solver,
            worker_id: config.worker_id.clone(),
            interval: Duration::from_secs(config.keepalive_interval_minutes as u64 * 60),
            stagger: DEFAULT_STAGGER,
            captcha_timeout: Duration::from_secs(config.captcha_timeout_secs),
            low_balance_threshold: LOW_BALANCE_THRESHOLD,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Signal [`Self::run_forever`] to stop after its current cycle (or
    /// current inter-cycle sleep). Safe to call at any time; there is no
    /// durable state of the service's own to reconcile on restart.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run_forever(&self) {
        while self.running.load(Ordering::SeqCst) {
            let stats = self.run_cycle().await;
            info!(
                total = stats.total,
                success = stats.success,
                failed = stats.failed,
                skipped = stats.skipped,
                duration_ms = stats.duration_ms,
                "keep-alive cycle finished"
            );

            let mut waited = Duration::ZERO;
            while waited < self.interval && self.running.load(Ordering::SeqCst) {
                let step = std::cmp::min(Duration::from_secs(1), self.interval - waited);
                tokio::time::sleep(step).await;
                waited += step;
            }
        }
    }

    pub async fn run_cycle(&self) -> CycleStats {
        let started = tokio::time::Instant::now();
        let mut stats = CycleStats::default();

        let accounts = match self.account_pool.list_active_accounts() {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(error = %err, "failed to list accounts for keep-alive cycle");
                stats.duration_ms = started.elapsed().as_millis() as u64;
                stats.finished_at = now_ts();
                return stats;
            }
        };

        for (i, account) in accounts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.stagger).await;
            }
            let outcome = self.refresh_one(account).await;
            stats.record(&outcome);
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        stats.finished_at = now_ts();
        if let Err(err) = stats.publish(self.store.as_ref()).await {
            warn!(error = %err, "failed to publish keep-alive cycle metrics");
        }
        stats
    }

    async fn refresh_one(&self, account: &DealerAccount) -> RefreshOutcome {
        match self.account_pool.is_leased(&account.id).await {
            Ok(true) => return RefreshOutcome::Skipped,
            Ok(false) => {}
            Err(err) => {
                warn!(account_id = %account.id, error = %err, "failed to check lease state, skipping this cycle");
                return RefreshOutcome::Failed;
            }
        }

        let client_handle = self.clients.get_or_create(&account.id);
        let mut client = client_handle.lock().await;
        let outcome = match self.refresh_session(&mut *client, account).await {
            Ok(refreshed) => {
                if refreshed {
                    RefreshOutcome::Refreshed
                } else {
                    RefreshOutcome::ValidatedNoOp
                }
            }
            Err(err) => {
                warn!(account_id = %account.id, error = %err, "keep-alive refresh failed");
                RefreshOutcome::Failed
            }
        };
        drop(client);

        if outcome != RefreshOutcome::Failed && outcome != RefreshOutcome::Skipped {
            if let Some(balance) = account.last_known_balance {
                if balance < self.low_balance_threshold {
                    self.notifier
                        .notify_low_balance(&account.id, balance, self.low_balance_threshold)
                        .await;
                }
            }
        }

        outcome
    }

    /// Returns `Ok(true)` if a fresh login happened, `Ok(false)` if a
    /// cached session merely validated and was re-saved with a fresh TTL.
    async fn refresh_session(&self, client: &mut C, account: &DealerAccount) -> JobProcessorResult<bool> {
        if let Some(session) = self.session_cache.get(&account.id).await? {
            client.import_session(session);
            if client.validate_session().await? {
                if let Some(fresh) = client.export_session() {
                    self.session_cache.put(&account.id, &fresh, DEFAULT_SESSION_TTL).await?;
                }
                return Ok(false);
            }
            self.session_cache.delete(&account.id).await?;
        }

        self.login(client, account).await?;
        Ok(true)
    }

    async fn login(&self, client: &mut C, account: &DealerAccount) -> JobProcessorResult<()> {
        let mut owns_lock = self
            .session_cache
            .acquire_login_lock(&account.id, &self.worker_id)
            .await?;
        if !owns_lock {
            let cleared = self
                .session_cache
                .wait_for_login_complete(&account.id, LOGIN_LOCK_WAIT)
                .await?;
            if cleared {
                if let Some(session) = self.session_cache.get(&account.id).await? {
                    client.import_session(session);
                    if client.validate_session().await? {
                        return Ok(());
                    }
                    self.session_cache.delete(&account.id).await?;
                }
            }
            owns_lock = self
                .session_cache
                .acquire_login_lock(&account.id, &self.worker_id)
                .await?;
        }

        let result = self.do_login(client, account).await;

        if owns_lock {
            self.session_cache.release_login_lock(&account.id, &self.worker_id).await?;
        }
        result
    }

    async fn do_login(&self, client: &mut C, account: &DealerAccount) -> JobProcessorResult<()> {
        let login = client
            .login(&account.username, &account.password, account.totp_seed.as_deref())
            .await?;

        if login.success {
            return self.cache_session(client, account).await;
        }

        if login.requires_captcha {
            let Some(solver) = &self.captcha_solver else {
                return Err(JobProcessorError::CaptchaRequired);
            };
            let image = login.captcha_image.clone().unwrap_or_default();
            let solution = tokio::time::timeout(self.captcha_timeout, solver.solve(&image))
                .await
                .map_err(|_| JobProcessorError::CaptchaRequired)?
                .map_err(|err| JobProcessorError::LoginFailed(format!("captcha solve failed: {err}")))?;
            let submitted = client
                .submit_login(&account.username, &account.password, account.totp_seed.as_deref(), &solution)
                .await?;
            if !submitted.success {
                return Err(JobProcessorError::LoginFailed(
                    submitted.error.unwrap_or_else(|| "captcha submission rejected".into()),
                ));
            }
            return self.cache_session(client, account).await;
        }

        Err(JobProcessorError::LoginFailed(
            login.error.unwrap_or_else(|| "login failed with no reason given".into()),
        ))
    }

    async fn cache_session(&self, client: &C, account: &DealerAccount) -> JobProcessorResult<()> {
        let session = client
            .export_session()
            .ok_or_else(|| JobProcessorError::InvariantViolation("login succeeded but no session was exported".into()))?;
        self.session_cache.put(&account.id, &session, DEFAULT_SESSION_TTL).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_adapter::RecordingNotifier;
    use session_cache::MemoryStore;
    use upstream_client::{LoginResult, ScriptedUpstreamClient};
    use worker_db::{queries as q, PoolConfig};

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

    fn seed_account(db: &DatabasePool, id: &str, balance: Option<f64>) {
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
                last_known_balance: balance,
                balance_updated_at: None,
                cooldown_until: 0,
                fail_reason: None,
                last_used_at: 0,
            },
        )
        .unwrap();
    }

    fn test_service(db: Arc<DatabasePool>, store: Arc<dyn SharedStore>, notifier: Arc<dyn notify_adapter::Notifier>) -> KeepAliveService<ScriptedUpstreamClient, fn() -> ScriptedUpstreamClient> {
        let account_pool = Arc::new(AccountPool::new(Arc::clone(&db), Arc::clone(&store)));
        KeepAliveService::new(db, store, account_pool, ScriptedUpstreamClient::new, notifier, None, &test_config())
    }

    #[tokio::test]
    async fn logs_in_fresh_when_no_session_is_cached() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let db = Arc::new(DatabasePool::open(&dir.join("ka1.db"), PoolConfig::default()).unwrap());
        seed_account(&db, "acc-1", Some(200.0));
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = test_service(Arc::clone(&db), Arc::clone(&store), Arc::clone(&notifier) as Arc<dyn notify_adapter::Notifier>);

        {
            let handle = service.clients.get_or_create("acc-1");
            let mut client = handle.lock().await;
            client.queue_login(Ok(LoginResult::success()));
        }

        let stats = service.run_cycle().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 0);

        let cached = service.session_cache.get("acc-1").await.unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn skips_accounts_with_a_live_lease() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let db = Arc::new(DatabasePool::open(&dir.join("ka2.db"), PoolConfig::default()).unwrap());
        seed_account(&db, "acc-1", Some(200.0));
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = test_service(Arc::clone(&db), Arc::clone(&store), Arc::clone(&notifier) as Arc<dyn notify_adapter::Notifier>);

        service.account_pool.acquire("some-job-worker", &[], None).await.unwrap();

        let stats = service.run_cycle().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.success, 0);
    }

    #[tokio::test]
    async fn low_balance_triggers_the_notifier_after_a_successful_refresh() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let db = Arc::new(DatabasePool::open(&dir.join("ka3.db"), PoolConfig::default()).unwrap());
        seed_account(&db, "acc-1", Some(10.0));
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = test_service(Arc::clone(&db), Arc::clone(&store), Arc::clone(&notifier) as Arc<dyn notify_adapter::Notifier>);

        {
            let handle = service.clients.get_or_create("acc-1");
            let mut client = handle.lock().await;
            client.queue_login(Ok(LoginResult::success()));
        }

        service.run_cycle().await;
        let sent = notifier.sent();
        assert!(sent.iter().any(|n| matches!(n, notify_adapter::RecordedNotification::LowBalance { account_id, .. } if account_id == "acc-1")));
    }

    #[tokio::test]
    async fn publishes_metrics_to_the_shared_store() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let db = Arc::new(DatabasePool::open(&dir.join("ka4.db"), PoolConfig::default()).unwrap());
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = test_service(Arc::clone(&db), Arc::clone(&store), Arc::clone(&notifier) as Arc<dyn notify_adapter::Notifier>);

        service.run_cycle().await;

        let raw = store.get(crate::metrics::METRICS_KEY).await.unwrap();
        assert!(raw.is_some());
    }
}
