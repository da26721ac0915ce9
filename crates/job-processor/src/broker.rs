//! [`JobSource`]: the durable FIFO job broker (§6 "Job broker"),
//! consumed generically so [`crate::worker::JobProcessorWorker`] never
//! depends on Redis directly. `RedisJobBroker` backs the `"operations"`
//! stream with a Redis Streams consumer group, giving at-least-once
//! delivery and a durable pending-entries list for retry; `InMemoryJobBroker`
//! is the in-process double used by handler tests.
//!
//! Redelivery backoff follows the same shape as the teacher's message
//! sync retry queue: `base * 2^(delivery_count - 1)`, capped at `max`.

use crate::error::{JobProcessorError, JobProcessorResult};
use crate::job::Job;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

pub const STREAM_KEY: &str = "operations";
pub const GROUP_NAME: &str = "workers";

/// Base and cap for the exponential redelivery backoff applied when
/// reclaiming stale pending entries.
const REDELIVER_BACKOFF_BASE: Duration = Duration::from_secs(2);
const REDELIVER_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// A job handed to a worker, carrying whatever the broker needs to later
/// ack or release it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub id: String,
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Receive the next available job, blocking up to `block` before
    /// returning `None`.
    async fn receive(&self, block: Duration) -> JobProcessorResult<Option<Delivery>>;

    /// Acknowledge successful (or terminally failed-and-handled) processing.
    async fn ack(&self, delivery: &Delivery) -> JobProcessorResult<()>;

    /// Reclaim pending entries whose consumer crashed or is stuck, once
    /// their backoff-scaled idle threshold has elapsed. Returns how many
    /// entries were reclaimed onto this consumer.
    async fn reclaim_stale(&self, consumer: &str) -> JobProcessorResult<usize>;
}

/// Redis Streams-backed job source.
pub struct RedisJobBroker {
    conn: redis::aio::ConnectionManager,
    consumer: String,
}

fn backoff_for(delivery_count: u64) -> Duration {
    if delivery_count == 0 {
        return REDELIVER_BACKOFF_BASE;
    }
    let scaled = REDELIVER_BACKOFF_BASE.as_secs().saturating_mul(1u64 << delivery_count.min(20));
    Duration::from_secs(scaled.min(REDELIVER_BACKOFF_MAX.as_secs()))
}

impl RedisJobBroker {
    pub async fn connect(redis_url: &str, consumer: impl Into<String>) -> JobProcessorResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(session_cache::StoreError::from)
            .map_err(JobProcessorError::Store)?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(session_cache::StoreError::from)
            .map_err(JobProcessorError::Store)?;
        let broker = Self {
            conn,
            consumer: consumer.into(),
        };
        broker.ensure_group().await?;
        Ok(broker)
    }

    async fn ensure_group(&self) -> JobProcessorResult<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(STREAM_KEY, GROUP_NAME, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(JobProcessorError::Store(err.into())),
        }
    }

    /// Publish a job onto the stream; used by admin/API tooling and by
    /// tests that exercise the concrete broker rather than the fake.
    pub async fn publish(&self, job: &Job) -> JobProcessorResult<String> {
        let mut conn = self.conn.clone();
        let raw = job.to_json().map_err(session_cache::StoreError::from)?;
        let id: String = conn
            .xadd(STREAM_KEY, "*", &[("job", raw)])
            .await
            .map_err(session_cache::StoreError::from)?;
        Ok(id)
    }
}

#[async_trait]
impl JobSource for RedisJobBroker {
    async fn receive(&self, block: Duration) -> JobProcessorResult<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(GROUP_NAME, &self.consumer)
            .count(1)
            .block(block.as_millis() as usize);

        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[STREAM_KEY], &[">"], &opts)
            .await
            .map_err(session_cache::StoreError::from)?;

        for stream_key in reply.keys {
            for stream_id in stream_key.ids {
                let raw: String = stream_id
                    .map
                    .get("job")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .ok_or_else(|| {
                        JobProcessorError::InvariantViolation("stream entry missing job field".into())
                    })?;
                let job = Job::from_json(&raw).map_err(session_cache::StoreError::from)?;
                return Ok(Some(Delivery { job, id: stream_id.id }));
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> JobProcessorResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(STREAM_KEY, GROUP_NAME, &[delivery.id.clone()])
            .await
            .map_err(session_cache::StoreError::from)?;
        Ok(())
    }

    async fn reclaim_stale(&self, consumer: &str) -> JobProcessorResult<usize> {
        let mut conn = self.conn.clone();
        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(STREAM_KEY, GROUP_NAME, "-", "+", 100)
            .await
            .map_err(session_cache::StoreError::from)?;

        let mut reclaimed = 0usize;
        for entry in pending.ids {
            let backoff = backoff_for(entry.times_delivered as u64);
            if (entry.idle as u64) < backoff.as_millis() as u64 {
                continue;
            }
            let claimed: redis::streams::StreamClaimReply = conn
                .xclaim(
                    STREAM_KEY,
                    GROUP_NAME,
                    consumer,
                    0,
                    &[entry.id.clone()],
                )
                .await
                .map_err(session_cache::StoreError::from)?;
            reclaimed += claimed.ids.len();
            if !claimed.ids.is_empty() {
                debug!(entry_id = %entry.id, idle_ms = entry.idle, "reclaimed stale stream entry");
            }
        }
        Ok(reclaimed)
    }
}

/// In-memory [`JobSource`] double for handler and worker-loop tests:
/// jobs are handed out FIFO and a delivery is only redelivered if
/// explicitly requeued (simulating a reclaim), never automatically.
#[derive(Default)]
pub struct InMemoryJobBroker {
    queue: Mutex<VecDeque<Delivery>>,
    acked: Mutex<Vec<String>>,
}

impl InMemoryJobBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, job: Job) {
        let id = uuid::Uuid::new_v4().to_string();
        self.queue.lock().unwrap().push_back(Delivery { job, id });
    }

    /// Put a delivery back at the tail, as if a reclaim had occurred.
    pub fn requeue(&self, delivery: Delivery) {
        self.queue.lock().unwrap().push_back(delivery);
    }

    pub fn acked_ids(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSource for InMemoryJobBroker {
    async fn receive(&self, _block: Duration) -> JobProcessorResult<Option<Delivery>> {
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn ack(&self, delivery: &Delivery) -> JobProcessorResult<()> {
        self.acked.lock().unwrap().push(delivery.id.clone());
        Ok(())
    }

    async fn reclaim_stale(&self, _consumer: &str) -> JobProcessorResult<usize> {
        warn!("InMemoryJobBroker does not track pending entries; nothing to reclaim");
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_db::OperationType;

    fn sample_job(id: &str) -> Job {
        Job {
            operation_id: id.into(),
            op_type: OperationType::StartRenewal,
            card_number: "1234567890".into(),
            duration: None,
            promo_code: None,
            user_id: "u1".into(),
            amount: 0.0,
            account_id: None,
            smartcard_type: "CISCO".into(),
        }
    }

    #[tokio::test]
    async fn in_memory_broker_delivers_fifo_and_tracks_acks() {
        let broker = InMemoryJobBroker::new();
        broker.publish(sample_job("op1"));
        broker.publish(sample_job("op2"));

        let first = broker.receive(Duration::from_millis(0)).await.unwrap().unwrap();
        assert_eq!(first.job.operation_id, "op1");
        broker.ack(&first).await.unwrap();

        let second = broker.receive(Duration::from_millis(0)).await.unwrap().unwrap();
        assert_eq!(second.job.operation_id, "op2");

        assert_eq!(broker.acked_ids(), vec![first.id]);
        assert!(broker.receive(Duration::from_millis(0)).await.unwrap().is_none());
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff_for(1), Duration::from_secs(2));
        assert_eq!(backoff_for(2), Duration::from_secs(4));
        assert_eq!(backoff_for(3), Duration::from_secs(8));
        assert_eq!(backoff_for(20), REDELIVER_BACKOFF_MAX);
    }
}
