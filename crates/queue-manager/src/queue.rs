//! [`QueueManager`]: fair FIFO waiting over the Account Pool (§4.3).
//!
//! When no account is immediately acquirable, callers are placed at the
//! tail of a single shared FIFO list keyed by operation id. A waiter is
//! only allowed to retry `AccountPool::acquire` once it reaches the head
//! of that list — so acquisition order among queued waiters always
//! matches enqueue order, and a caller that raced in without queuing
//! never jumps ahead of someone already waiting.

use crate::error::QueueResult;
use account_pool::AccountPool;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use worker_db::DealerAccount;

const QUEUE_KEY: &str = "account-wait-queue";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of [`QueueManager::acquire_with_queue`].
#[derive(Debug)]
pub struct WaitOutcome {
    pub account: Option<DealerAccount>,
    pub waited: Duration,
    pub timed_out: bool,
}

pub struct QueueManager {
    pool: AccountPool,
    store: std::sync::Arc<dyn session_cache::SharedStore>,
}

impl QueueManager {
    pub fn new(pool: AccountPool, store: std::sync::Arc<dyn session_cache::SharedStore>) -> Self {
        Self { pool, store }
    }

    /// Acquire an account, waiting in a fair FIFO queue if none is
    /// immediately available. `worker_id` both identifies the lease
    /// holder and doubles as this waiter's queue token — one operation
    /// is never concurrently queued twice, so the operation id itself is
    /// the natural token.
    pub async fn acquire_with_queue(
        &self,
        operation_id: &str,
        worker_id: &str,
        exclude: &[String],
        min_balance: Option<f64>,
    ) -> QueueResult<WaitOutcome> {
        self.acquire_with_queue_timeout(operation_id, worker_id, exclude, min_balance, DEFAULT_TIMEOUT)
            .await
    }

    pub async fn acquire_with_queue_timeout(
        &self,
        operation_id: &str,
        worker_id: &str,
        exclude: &[String],
        min_balance: Option<f64>,
        timeout: Duration,
    ) -> QueueResult<WaitOutcome> {
        let started = Instant::now();

        if let Some(account) = self.pool.acquire(worker_id, exclude, min_balance).await? {
            return Ok(WaitOutcome {
                account: Some(account),
                waited: started.elapsed(),
                timed_out: false,
            });
        }

        self.store.rpush(QUEUE_KEY, operation_id).await?;
        debug!(%operation_id, "enqueued for account");

        let outcome = loop {
            if started.elapsed() > timeout {
                self.store.lrem(QUEUE_KEY, operation_id).await?;
                break WaitOutcome {
                    account: None,
                    waited: started.elapsed(),
                    timed_out: true,
                };
            }

            let head = self.store.lpeek_front(QUEUE_KEY).await?;
            if head.as_deref() == Some(operation_id) {
                if let Some(account) = self.pool.acquire(worker_id, exclude, min_balance).await? {
                    self.store.lrem(QUEUE_KEY, operation_id).await?;
                    break WaitOutcome {
                        account: Some(account),
                        waited: started.elapsed(),
                        timed_out: false,
                    };
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        };

        if outcome.account.is_some() {
            info!(%operation_id, waited_ms = outcome.waited.as_millis() as u64, "acquired account after waiting");
        }
        Ok(outcome)
    }
}
