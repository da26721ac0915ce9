//! [`SessionCache`]: TTL-keyed session storage plus the single-flight
//! login lock (§4.1).

use crate::error::StoreResult;
use crate::session::Session;
use crate::shared_store::SharedStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default session TTL: the upstream portal's ~15 min idle cutoff, plus
/// one minute of slack so the cache never races the server-side expiry.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(16 * 60);

/// Fixed TTL for the single-flight login lock.
const LOGIN_LOCK_TTL: Duration = Duration::from_secs(60);

/// Poll interval while waiting for another worker's login to complete.
const LOGIN_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn session_key(account_id: &str) -> String {
    format!("session:{account_id}")
}

fn login_lock_key(account_id: &str) -> String {
    format!("login-lock:{account_id}")
}

/// Hit/miss counters for [`SessionCache::get`], exposed for the
/// admin/observability surface mentioned in §6.1.
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

pub struct SessionCache {
    store: Arc<dyn SharedStore>,
    counters: CacheCounters,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            counters: CacheCounters::default(),
        }
    }

    /// Fetch the cached session for `account_id`, if any. Increments the
    /// hit/miss counters (§4.1).
    pub async fn get(&self, account_id: &str) -> StoreResult<Option<Session>> {
        let raw = self.store.get(&session_key(account_id)).await?;
        match raw {
            Some(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(session))
                }
                Err(err) => {
                    warn!(%account_id, error = %err, "dropping unparseable cached session");
                    self.store.delete(&session_key(account_id)).await?;
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
            },
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Cache `session` for `account_id` with the given TTL.
    pub async fn put(&self, account_id: &str, session: &Session, ttl: Duration) -> StoreResult<()> {
        let raw = serde_json::to_string(session)?;
        self.store.set_ex(&session_key(account_id), &raw, ttl).await?;
        debug!(%account_id, ttl_secs = ttl.as_secs(), "cached upstream session");
        Ok(())
    }

    /// Remove a session on detected invalidation.
    pub async fn delete(&self, account_id: &str) -> StoreResult<()> {
        self.store.delete(&session_key(account_id)).await?;
        Ok(())
    }

    /// Refresh a cached session's TTL, only if it is still present.
    pub async fn extend(&self, account_id: &str, ttl: Duration) -> StoreResult<bool> {
        self.store.expire(&session_key(account_id), ttl).await
    }

    pub fn hits(&self) -> u64 {
        self.counters.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.counters.misses.load(Ordering::Relaxed)
    }

    /// Attempt to become the single worker logging in for `account_id`.
    /// Returns `true` iff this worker now owns the login lock.
    pub async fn acquire_login_lock(&self, account_id: &str, worker_id: &str) -> StoreResult<bool> {
        self.store
            .set_nx_ex(&login_lock_key(account_id), worker_id, LOGIN_LOCK_TTL)
            .await
    }

    /// Release a login lock this worker holds. Compare-and-delete: a
    /// worker that lost the lock to TTL expiry (and thus to another
    /// worker) cannot release someone else's lock (P3).
    pub async fn release_login_lock(&self, account_id: &str, worker_id: &str) -> StoreResult<bool> {
        self.store
            .delete_if_eq(&login_lock_key(account_id), worker_id)
            .await
    }

    /// Poll until the login lock for `account_id` clears or `timeout`
    /// elapses. Returns `true` if the lock cleared within the deadline.
    pub async fn wait_for_login_complete(&self, account_id: &str, timeout: Duration) -> StoreResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.store.exists(&login_lock_key(account_id)).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LOGIN_WAIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    fn sample_session(expires_at: i64) -> Session {
        Session {
            cookies: "cookie-jar".into(),
            view_state: "vs-blob".into(),
            expires_at,
            login_timestamp: 0,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = SessionCache::new(Arc::new(MemoryStore::new()));
        let session = sample_session(1_000);
        cache.put("acc-1", &session, Duration::from_secs(60)).await.unwrap();
        let fetched = cache.get("acc-1").await.unwrap().unwrap();
        assert_eq!(fetched, session);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 0);
    }

    #[tokio::test]
    async fn miss_increments_miss_counter() {
        let cache = SessionCache::new(Arc::new(MemoryStore::new()));
        assert!(cache.get("nope").await.unwrap().is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let cache = SessionCache::new(Arc::new(MemoryStore::new()));
        cache
            .put("acc-1", &sample_session(1_000), Duration::from_secs(60))
            .await
            .unwrap();
        cache.delete("acc-1").await.unwrap();
        assert!(cache.get("acc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extend_is_noop_when_absent() {
        let cache = SessionCache::new(Arc::new(MemoryStore::new()));
        assert!(!cache.extend("ghost", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn login_lock_is_single_flight() {
        let cache = SessionCache::new(Arc::new(MemoryStore::new()));
        assert!(cache.acquire_login_lock("acc-1", "worker-a").await.unwrap());
        assert!(!cache.acquire_login_lock("acc-1", "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn release_login_lock_requires_ownership() {
        let cache = SessionCache::new(Arc::new(MemoryStore::new()));
        cache.acquire_login_lock("acc-1", "worker-a").await.unwrap();
        assert!(!cache.release_login_lock("acc-1", "worker-b").await.unwrap());
        assert!(cache.release_login_lock("acc-1", "worker-a").await.unwrap());
        assert!(cache.acquire_login_lock("acc-1", "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_login_complete_returns_true_once_released() {
        let cache = Arc::new(SessionCache::new(Arc::new(MemoryStore::new())));
        cache.acquire_login_lock("acc-1", "worker-a").await.unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .wait_for_login_complete("acc-1", Duration::from_secs(2))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.release_login_lock("acc-1", "worker-a").await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_login_complete_times_out() {
        let cache = SessionCache::new(Arc::new(MemoryStore::new()));
        cache.acquire_login_lock("acc-1", "worker-a").await.unwrap();
        let cleared = cache
            .wait_for_login_complete("acc-1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!cleared);
    }
}
