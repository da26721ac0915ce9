//! CAPTCHA handling (§4.6 "Session-retry wrapper", `START_RENEWAL` step 3):
//! auto-solve via an external vendor when configured, else pause the
//! operation to `AWAITING_CAPTCHA` and poll for a human-supplied solution.
//!
//! The solving vendor integration is interface-only per §1 Non-goals;
//! this crate ships the trait plus a scripted fake.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptchaSolverError {
    #[error("no solver configured")]
    NotConfigured,
    #[error("solver error: {0}")]
    Vendor(String),
}

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Solve the CAPTCHA presented as `image` (a base64 or URL payload,
    /// opaque to this trait), returning the textual solution.
    async fn solve(&self, image: &str) -> Result<String, CaptchaSolverError>;
}

/// A solver backed by a configured vendor API key. No HTTP vendor
/// implementation ships in this workspace (out of scope); this wraps a
/// caller-supplied solve function so a concrete vendor binding can be
/// plugged in without job-processor depending on it directly.
pub struct ConfiguredSolver<F> {
    solve_fn: F,
}

impl<F> ConfiguredSolver<F>
where
    F: Fn(&str) -> Result<String, CaptchaSolverError> + Send + Sync,
{
    pub fn new(solve_fn: F) -> Self {
        Self { solve_fn }
    }
}

#[async_trait]
impl<F> CaptchaSolver for ConfiguredSolver<F>
where
    F: Fn(&str) -> Result<String, CaptchaSolverError> + Send + Sync,
{
    async fn solve(&self, image: &str) -> Result<String, CaptchaSolverError> {
        (self.solve_fn)(image)
    }
}

/// Poll interval for `AWAITING_CAPTCHA`: §5 names 2 s.
pub const CAPTCHA_POLL_INTERVAL: Duration = Duration::from_secs(2);
