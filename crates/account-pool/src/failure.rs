//! Failure classification used to size an account's cooldown (§4.2).

use std::time::Duration;

/// Why a handler gave up on an account mid-operation. The cooldown period
/// is sized to the kind: a balance shortfall is likely to persist until
/// someone tops the account up, while a login or CAPTCHA hiccup is often
/// transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    InsufficientBalance,
    LoginFailed,
    CaptchaFailed,
    UpstreamError,
}

impl FailureReason {
    pub fn cooldown(self) -> Duration {
        match self {
            FailureReason::InsufficientBalance => Duration::from_secs(30 * 60),
            FailureReason::LoginFailed | FailureReason::CaptchaFailed => Duration::from_secs(5 * 60),
            FailureReason::UpstreamError => Duration::from_secs(2 * 60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::InsufficientBalance => "insufficient_balance",
            FailureReason::LoginFailed => "login_failed",
            FailureReason::CaptchaFailed => "captcha_failed",
            FailureReason::UpstreamError => "upstream_error",
        }
    }
}
