//! Dealer account leasing, cooldowns, and priority selection (§4.2).
//!
//! The directory of accounts (priority, active flag, cooldown, cached
//! balance) is relational and lives in [`worker_db`]; the short-lived
//! busy-lease that enforces "one worker per account at a time" lives in
//! the shared store behind [`session_cache::SharedStore`].

mod error;
mod failure;
mod pool;

pub use error::{AccountPoolError, AccountPoolResult};
pub use failure::FailureReason;
pub use pool::{AccountPool, LEASE_TTL};
