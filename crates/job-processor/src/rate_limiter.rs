//! Per-worker job-processing ceiling (§5 "Rate limits"): a worker process
//! accepts at most `worker_rate_limit_per_minute` jobs per rolling minute.
//! Purely in-process — the ceiling bounds one worker's own throughput, it
//! is not cross-process coordination like the Account Pool lease.

use std::sync::Mutex;
use tokio::time::{Duration, Instant};

pub struct RateLimiter {
    limit: u32,
    window: Mutex<Window>,
}

struct Window {
    started_at: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit: limit_per_minute,
            window: Mutex::new(Window {
                started_at: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Block until the current minute window has capacity, then consume
    /// one slot. Never denies outright: a full window is a wait, not a
    /// rejection, since the worker loop has nothing better to do anyway.
    pub async fn acquire(&self) {
        loop {
            {
                let mut window = self.window.lock().unwrap();
                if window.started_at.elapsed() >= Duration::from_secs(60) {
                    window.started_at = Instant::now();
                    window.count = 0;
                }
                if window.count < self.limit {
                    window.count += 1;
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}
