//! Upstream client error types.

use thiserror::Error;

/// Errors a concrete [`crate::UpstreamClient`] implementation may raise.
/// `SessionExpired` is the variant the job processor's session-retry
/// wrapper matches on to trigger a transparent re-login (§4.6).
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("session expired")]
    SessionExpired,

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("upstream transient error: {0}")]
    Transient(String),

    #[error("no active session")]
    NoActiveSession,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

impl UpstreamError {
    /// Whether an error's message matches the session-expired pattern the
    /// session-retry wrapper looks for, per §4.6: `"Session Expired"`,
    /// `"Session expired"`, `"login page"`, `"Login page"`.
    pub fn looks_like_session_expired(message: &str) -> bool {
        let needles = ["Session Expired", "Session expired", "login page", "Login page"];
        needles.iter().any(|n| message.contains(n))
    }
}
