//! The job consumption loop (§5 "Scheduling model"): `worker_concurrency`
//! concurrent tasks each long-poll the broker, apply the worker's
//! rate-limit ceiling, and dispatch through `job_processor::process`.

use job_processor::{Delivery, JobContext, JobSource, RateLimiter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use upstream_client::UpstreamClient;

const RECEIVE_BLOCK: Duration = Duration::from_secs(2);
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

/// One of `worker_concurrency` loops: receive, rate-limit, dispatch, ack.
/// Checks `running` between deliveries so a short `RECEIVE_BLOCK` keeps
/// shutdown latency bounded.
pub async fn run_handler_loop<C, F>(
    ctx: Arc<JobContext<C, F>>,
    broker: Arc<dyn JobSource>,
    rate_limiter: Arc<RateLimiter>,
    running: Arc<AtomicBool>,
) where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    while running.load(Ordering::SeqCst) {
        let delivery = match broker.receive(RECEIVE_BLOCK).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(err) => {
                error!(error = %err, "job broker receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        rate_limiter.acquire().await;
        process_delivery(&ctx, &*broker, delivery).await;
    }
}

async fn process_delivery<C, F>(ctx: &JobContext<C, F>, broker: &dyn JobSource, delivery: Delivery)
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    let operation_id = delivery.job.operation_id.clone();
    match job_processor::process(ctx, &delivery.job).await {
        Ok(()) => info!(%operation_id, "operation handled"),
        Err(err) => warn!(%operation_id, error = %err, "operation handler returned an error"),
    }
    if let Err(err) = broker.ack(&delivery).await {
        error!(%operation_id, error = %err, "failed to ack delivery");
    }
}

/// Periodically reclaims stream entries whose consumer crashed or
/// stalled (§6 "at-least-once delivery, retry with exponential back-off").
pub async fn run_reclaim_loop(broker: Arc<dyn JobSource>, consumer: String, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match broker.reclaim_stale(&consumer).await {
            Ok(0) => {}
            Ok(n) => info!(reclaimed = n, "reclaimed stale deliveries"),
            Err(err) => error!(error = %err, "reclaim_stale failed"),
        }

        let mut waited = Duration::ZERO;
        while waited < RECLAIM_INTERVAL && running.load(Ordering::SeqCst) {
            let step = std::cmp::min(Duration::from_secs(1), RECLAIM_INTERVAL - waited);
            tokio::time::sleep(step).await;
            waited += step;
        }
    }
}
