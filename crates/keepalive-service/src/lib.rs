//! Background session refresh over the dealer account directory (§4.7).
//!
//! Runs alongside the job-processor worker pool, sharing its session
//! cache, account pool, and per-account client registry, but as an
//! independent cycle rather than a job-triggered path: it keeps sessions
//! warm for accounts no job currently has leased, so a renewal request
//! doesn't pay a cold-login cost on the critical path.

pub mod cycle;
pub mod metrics;

pub use cycle::{KeepAliveService, DEFAULT_STAGGER, LOW_BALANCE_THRESHOLD};
pub use metrics::{CycleStats, RefreshOutcome, METRICS_KEY};
