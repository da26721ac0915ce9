//! [`AccountPool`]: leasing, cooldowns, and priority selection over the
//! dealer account directory (§4.2).
//!
//! The account directory (priority, active flag, cooldown-until,
//! last-known-balance) lives in the relational store so it stays visible
//! to admin tooling. The busy-lease is short-lived, cross-process, and
//! needs atomic test-and-set semantics that don't belong on a SQL row, so
//! it lives in the shared store instead, keyed off the account id.

use crate::error::{AccountPoolError, AccountPoolResult};
use crate::failure::FailureReason;
use session_cache::SharedStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use worker_db::{queries, DatabasePool, DealerAccount};

/// How long a lease survives without a heartbeat before another worker
/// may reclaim the account (P4: a crashed worker's lease self-heals).
pub const LEASE_TTL: Duration = Duration::from_secs(60);

fn lease_key(account_id: &str) -> String {
    format!("lease:{account_id}")
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct AccountPool {
    db: Arc<DatabasePool>,
    store: Arc<dyn SharedStore>,
}

impl AccountPool {
    pub fn new(db: Arc<DatabasePool>, store: Arc<dyn SharedStore>) -> Self {
        Self { db, store }
    }

    /// Lease the highest-priority usable account not already leased,
    /// excluded, or on cooldown. Ties are broken by oldest `last_used_at`.
    /// Returns `None` (not an error) when nothing currently qualifies —
    /// callers decide whether that's fatal or worth a retry (the Queue
    /// Manager retries; direct callers usually don't).
    pub async fn acquire(
        &self,
        worker_id: &str,
        exclude: &[String],
        min_balance: Option<f64>,
    ) -> AccountPoolResult<Option<DealerAccount>> {
        let now = now_ts();
        let candidates = {
            let conn = self.db.get()?;
            queries::list_active_accounts_by_priority(&conn)?
        };

        for account in candidates {
            if !account.is_usable(now) {
                continue;
            }
            if exclude.iter().any(|id| id == &account.id) {
                continue;
            }
            if let Some(min) = min_balance {
                match account.last_known_balance {
                    Some(balance) if balance >= min => {}
                    _ => continue,
                }
            }

            let leased = self
                .store
                .set_nx_ex(&lease_key(&account.id), worker_id, LEASE_TTL)
                .await?;
            if leased {
                debug!(account_id = %account.id, %worker_id, "leased account");
                return Ok(Some(account));
            }
            // Another worker beat us to this candidate; try the next one.
        }

        Ok(None)
    }

    /// Lease one specific account id, polling until it becomes free or
    /// `timeout` elapses (§4.6 CONFIRM_PURCHASE: the operation is already
    /// bound to an account from an earlier step and cannot fail over to a
    /// different one). Returns `Ok(None)` on timeout rather than an error,
    /// matching `acquire`'s not-found convention.
    pub async fn acquire_specific(
        &self,
        account_id: &str,
        worker_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> AccountPoolResult<Option<DealerAccount>> {
        let account = {
            let conn = self.db.get()?;
            queries::get_dealer_account(&conn, account_id)?
        };
        let Some(account) = account else {
            return Ok(None);
        };
        if !account.is_usable(now_ts()) {
            return Ok(None);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .store
                .set_nx_ex(&lease_key(account_id), worker_id, LEASE_TTL)
                .await?
            {
                debug!(%account_id, %worker_id, "leased specific account");
                return Ok(Some(account));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Heartbeat: extend a held lease's TTL. Called periodically by the
    /// job holding the account so a live worker never loses its lease to
    /// expiry mid-operation.
    pub async fn renew_lease(&self, account_id: &str) -> AccountPoolResult<bool> {
        Ok(self.store.expire(&lease_key(account_id), LEASE_TTL).await?)
    }

    /// Release a lease this worker holds. Compare-and-delete: a worker
    /// that already lost the lease to TTL expiry cannot release whatever
    /// worker holds it now.
    pub async fn release(&self, account_id: &str, worker_id: &str) -> AccountPoolResult<bool> {
        Ok(self
            .store
            .delete_if_eq(&lease_key(account_id), worker_id)
            .await?)
    }

    /// Unconditionally clear a lease, e.g. from an admin tool recovering
    /// an account a worker is known to have abandoned.
    pub async fn force_release(&self, account_id: &str) -> AccountPoolResult<()> {
        self.store.delete(&lease_key(account_id)).await?;
        Ok(())
    }

    /// Put an account on cooldown after a failed operation and clear its
    /// lease so another worker doesn't wait out the TTL for nothing.
    pub async fn mark_failed(&self, account_id: &str, reason: FailureReason) -> AccountPoolResult<()> {
        let now = now_ts();
        let until = now + reason.cooldown().as_secs() as i64;
        {
            let conn = self.db.get()?;
            queries::set_account_cooldown(&conn, account_id, until, reason.as_str())?;
        }
        self.force_release(account_id).await?;
        warn!(%account_id, reason = reason.as_str(), cooldown_until = until, "account put on cooldown");
        Ok(())
    }

    /// Record a successful use: bump `last_used_at` (so the account
    /// rotates to the back of the priority tie-break) and clear the
    /// lease.
    pub async fn mark_used(&self, account_id: &str) -> AccountPoolResult<()> {
        let now = now_ts();
        {
            let conn = self.db.get()?;
            queries::mark_account_used(&conn, account_id, now)?;
        }
        self.store.delete(&lease_key(account_id)).await?;
        info!(%account_id, "account use recorded");
        Ok(())
    }

    /// Update the cached dealer balance, e.g. after `CHECK_ACCOUNT_BALANCE`.
    pub async fn update_balance(&self, account_id: &str, balance: f64) -> AccountPoolResult<()> {
        let now = now_ts();
        let conn = self.db.get()?;
        queries::update_account_balance(&conn, account_id, balance, now)?;
        Ok(())
    }

    pub fn get_account(&self, account_id: &str) -> AccountPoolResult<Option<DealerAccount>> {
        let conn = self.db.get()?;
        Ok(queries::get_dealer_account(&conn, account_id)?)
    }

    /// Whether some worker currently holds `account_id`'s lease (used by
    /// the keep-alive cycle to skip an account a live job is already
    /// keeping warm, §4.7).
    pub async fn is_leased(&self, account_id: &str) -> AccountPoolResult<bool> {
        Ok(self.store.exists(&lease_key(account_id)).await?)
    }

    /// All accounts the pool considers for leasing, priority order, for
    /// callers that need to walk the whole directory rather than acquire
    /// one (the keep-alive cycle).
    pub fn list_active_accounts(&self) -> AccountPoolResult<Vec<DealerAccount>> {
        let conn = self.db.get()?;
        Ok(queries::list_active_accounts_by_priority(&conn)?)
    }
}
