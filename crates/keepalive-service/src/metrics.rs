//! Per-cycle counters published to the shared store for the admin UI
//! (§4.7 step 3).

use serde::{Deserialize, Serialize};
use session_cache::SharedStore;
use std::time::Duration;

/// Key the latest cycle's counters are published under.
pub const METRICS_KEY: &str = "keepalive:metrics";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CycleStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub finished_at: i64,
}

impl CycleStats {
    pub fn record(&mut self, outcome: &RefreshOutcome) {
        self.total += 1;
        match outcome {
            RefreshOutcome::Refreshed | RefreshOutcome::ValidatedNoOp => self.success += 1,
            RefreshOutcome::Skipped => self.skipped += 1,
            RefreshOutcome::Failed => self.failed += 1,
        }
    }

    pub async fn publish(&self, store: &dyn SharedStore) -> session_cache::StoreResult<()> {
        let raw = serde_json::to_string(self).unwrap_or_default();
        // A day's worth of slack: stale but present beats absent if a
        // cycle stalls, and the admin UI can still show "last seen" age.
        store.set_ex(METRICS_KEY, &raw, Duration::from_secs(24 * 60 * 60)).await
    }
}

/// What happened to one account during a cycle, used only to tally
/// [`CycleStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Session was absent or invalid and a fresh login succeeded.
    Refreshed,
    /// Cached session validated fine and was re-saved with a fresh TTL.
    ValidatedNoOp,
    /// A live pool lease meant a job is already keeping this account warm.
    Skipped,
    /// Login or validation failed.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_buckets_outcomes_correctly() {
        let mut stats = CycleStats::default();
        stats.record(&RefreshOutcome::Refreshed);
        stats.record(&RefreshOutcome::ValidatedNoOp);
        stats.record(&RefreshOutcome::Skipped);
        stats.record(&RefreshOutcome::Failed);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 1);
    }
}
