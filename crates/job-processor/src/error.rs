//! [`JobProcessorError`]: the error enum handlers return, carrying the
//! taxonomy kinds from §7 directly so [`crate::dispatch`]'s wrapper can
//! match on [`JobProcessorError::kind`] to decide refund-and-fail versus
//! early-return, without needing to know which crate actually raised it.

use thiserror::Error;
use worker_core::ErrorKind;

#[derive(Debug, Error)]
pub enum JobProcessorError {
    /// The operation's status was observed as `CANCELLED` at a
    /// cancellation checkpoint.
    #[error("operation cancelled")]
    Cancelled,

    /// The queue wait for an account exceeded its deadline, or every
    /// candidate account was excluded/on cooldown.
    #[error("no account became available: {0}")]
    NoAvailableAccounts(String),

    /// Every candidate account's upstream balance was below the
    /// package/installment price.
    #[error("no dealer account had sufficient balance")]
    InsufficientDealerBalance,

    /// Session-expired signal that survived one session-retry attempt.
    #[error("session expired and re-login did not recover it")]
    SessionExpired,

    /// CAPTCHA required but not auto-solved before the wait deadline.
    #[error("captcha required and not solved in time")]
    CaptchaRequired,

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("confirmation window expired")]
    ConfirmationTimeout,

    /// A duplicate delivery of an already-terminal or already-handled
    /// operation; always a no-op, never a failure.
    #[error("duplicate delivery, already handled")]
    DuplicateDelivery,

    /// A precondition the handler should never observe in correct
    /// operation, e.g. a missing session snapshot at confirm time.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Database(#[from] worker_db::DatabaseError),

    #[error(transparent)]
    Store(#[from] session_cache::StoreError),

    #[error(transparent)]
    AccountPool(#[from] account_pool::AccountPoolError),

    #[error(transparent)]
    Queue(#[from] queue_manager::QueueError),

    #[error(transparent)]
    ResourceCache(#[from] resource_cache::ResourceCacheError),

    #[error(transparent)]
    Ledger(#[from] ledger_core::LedgerError),

    #[error("failed to (de)serialize a session snapshot: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<upstream_client::UpstreamError> for JobProcessorError {
    fn from(err: upstream_client::UpstreamError) -> Self {
        match err {
            upstream_client::UpstreamError::SessionExpired => JobProcessorError::SessionExpired,
            upstream_client::UpstreamError::LoginFailed(msg) => JobProcessorError::LoginFailed(msg),
            upstream_client::UpstreamError::NoActiveSession => {
                JobProcessorError::InvariantViolation("no active upstream session".into())
            }
            upstream_client::UpstreamError::Transient(msg) => JobProcessorError::UpstreamTransient(msg),
            upstream_client::UpstreamError::Json(err) => JobProcessorError::UpstreamTransient(err.to_string()),
        }
    }
}

impl JobProcessorError {
    /// Map this error onto the taxonomy kind named in §7, the
    /// information the dispatch wrapper actually reasons about.
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobProcessorError::Cancelled => ErrorKind::Cancelled,
            JobProcessorError::NoAvailableAccounts(_) => ErrorKind::NoAvailableAccounts,
            JobProcessorError::InsufficientDealerBalance => ErrorKind::InsufficientDealerBalance,
            JobProcessorError::SessionExpired => ErrorKind::SessionExpired,
            JobProcessorError::CaptchaRequired => ErrorKind::CaptchaRequired,
            JobProcessorError::LoginFailed(_) => ErrorKind::LoginFailed,
            JobProcessorError::UpstreamTransient(_) => ErrorKind::UpstreamTransient,
            JobProcessorError::ConfirmationTimeout => ErrorKind::ConfirmationTimeout,
            JobProcessorError::DuplicateDelivery => ErrorKind::DuplicateDelivery,
            JobProcessorError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            // Infrastructure failures are treated as transient/upstream-adjacent:
            // unexpected, but still refundable rather than silently swallowed.
            JobProcessorError::Database(_)
            | JobProcessorError::Store(_)
            | JobProcessorError::AccountPool(_)
            | JobProcessorError::Queue(_)
            | JobProcessorError::ResourceCache(_)
            | JobProcessorError::Ledger(_) => ErrorKind::UpstreamTransient,
            JobProcessorError::Serde(_) => ErrorKind::InvariantViolation,
        }
    }
}

pub type JobProcessorResult<T> = Result<T, JobProcessorError>;
