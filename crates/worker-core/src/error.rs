//! Error taxonomy shared across the worker-tier crates.
//!
//! Each crate in this workspace defines its own `thiserror` enum for the
//! failures it can produce locally, but the *kinds* a job handler ultimately
//! reasons about (recoverable vs. fatal, refund vs. no-refund) are the ones
//! enumerated here. `job-processor` maps its own error enum onto
//! [`ErrorKind`] to decide how the handler wrapper should react.

use thiserror::Error;

/// Top-level error type for `worker-core` itself (config and path failures).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid value for environment variable {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve a home/config directory for this platform")]
    NoHomeDir,
}

pub type CoreResult<T> = Result<T, CoreError>;

/// The error taxonomy named in the error-handling design: a kind, not a
/// language type. Any crate's error enum can expose `fn kind(&self) ->
/// ErrorKind` so `job-processor`'s handler wrapper can dispatch on it
/// without knowing the concrete error type that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-initiated cancellation. Early return, no refund from this site.
    Cancelled,
    /// The queue timed out before an account became available.
    NoAvailableAccounts,
    /// Every candidate account's upstream balance was below the required
    /// minimum.
    InsufficientDealerBalance,
    /// A session-expired signal (thrown or structured) that the session
    /// retry wrapper already tried once and failed again.
    SessionExpired,
    /// Login requires a CAPTCHA that could not be auto-solved and the
    /// wait-for-solution deadline lapsed.
    CaptchaRequired,
    /// Login failed for a reason other than CAPTCHA or session expiry.
    LoginFailed,
    /// Network failure, 5xx, or timeout talking to the upstream.
    UpstreamTransient,
    /// The final-confirm deadline lapsed before confirmation arrived.
    ConfirmationTimeout,
    /// A duplicate delivery of a job already handled; always a no-op.
    DuplicateDelivery,
    /// A precondition the handler should never observe in correct
    /// operation (e.g. a missing session snapshot at confirm time).
    InvariantViolation,
}

impl ErrorKind {
    /// Whether a failure of this kind should trigger a refund of the
    /// operation's current `amount` (if `amount > 0`) as part of failing it.
    pub fn refunds(self) -> bool {
        !matches!(self, ErrorKind::Cancelled | ErrorKind::DuplicateDelivery)
    }
}
