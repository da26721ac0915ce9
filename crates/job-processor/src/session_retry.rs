//! The session-retry wrapper (§4.6 "Session-retry wrapper"): every
//! upstream call a handler makes after a session is established goes
//! through this so a session that expired mid-operation is transparently
//! recovered by one re-login attempt, rather than failing the whole job.
//!
//! Steps, per the design: (1) run the call, (2) if it throws or returns a
//! structured session-expired signal, re-login once, (3) retry the call
//! exactly once more, (4) surface whatever the retry produces, expired or
//! not — a second expiry is a real failure, not something to loop on.
//!
//! `op` and `relogin` both take `&mut C` rather than capturing it, since a
//! closure that captures `client` by unique reference can't coexist with a
//! second closure doing the same — this is the only shape the borrow
//! checker accepts for "run one thing, maybe re-login, run it again" over
//! a single client handle.

use crate::error::{JobProcessorError, JobProcessorResult};
use std::future::Future;
use std::pin::Pin;
use upstream_client::{UpstreamError, UpstreamResult};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Run `op(client)`, transparently recovering from a session-expired signal
/// with one `relogin(client)` attempt and one retry. `looks_expired`
/// inspects a *successful* result for the structured `{success: false,
/// error}` shape some upstream calls use instead of throwing (e.g.
/// `load_packages`).
pub async fn with_session_retry<'c, C, T>(
    client: &'c mut C,
    op: impl for<'a> Fn(&'a mut C) -> BoxFuture<'a, UpstreamResult<T>>,
    looks_expired: impl Fn(&T) -> bool,
    relogin: impl for<'a> Fn(&'a mut C) -> BoxFuture<'a, JobProcessorResult<()>>,
) -> JobProcessorResult<T> {
    match op(client).await {
        Ok(value) if looks_expired(&value) => {
            relogin(client).await?;
            Ok(op(client).await?)
        }
        Ok(value) => Ok(value),
        Err(UpstreamError::SessionExpired) => {
            relogin(client).await?;
            Ok(op(client).await?)
        }
        Err(err) if UpstreamError::looks_like_session_expired(&err.to_string()) => {
            relogin(client).await?;
            Ok(op(client).await?)
        }
        Err(err) => Err(JobProcessorError::from(err)),
    }
}
