//! The operation state machine worker (§4.6): turns a [`job::Job`] popped
//! off the broker into upstream calls against a dealer account, driving
//! the operation's row through its status chart with refund-on-failure
//! and session-retry baked into [`dispatch::run_handler`].
//!
//! [`process`] is the single entry point a consumption loop calls; it
//! dispatches purely on `job.op_type`, so adding an operation type means
//! adding one match arm plus its handler module.

pub mod broker;
pub mod captcha;
pub mod client_registry;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod job;
pub mod login;
pub mod rate_limiter;
pub mod session_retry;

pub use broker::{Delivery, InMemoryJobBroker, JobSource, RedisJobBroker};
pub use context::JobContext;
pub use error::{JobProcessorError, JobProcessorResult};
pub use job::Job;
pub use rate_limiter::RateLimiter;

use upstream_client::UpstreamClient;
use worker_db::OperationType;

/// Route `job` to its handler by `op_type`. Each handler owns its own
/// status-chart and ledger bookkeeping; this function is nothing more
/// than the switch.
pub async fn process<C, F>(ctx: &JobContext<C, F>, job: &Job) -> JobProcessorResult<()>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    match job.op_type {
        OperationType::StartRenewal => handlers::start_renewal::handle(ctx, job).await,
        OperationType::CompletePurchase => handlers::complete_purchase::handle(ctx, job).await,
        OperationType::ConfirmPurchase => handlers::confirm_purchase::handle(ctx, job).await,
        OperationType::CancelConfirm => handlers::cancel_confirm::handle(ctx, job).await,
        OperationType::SignalCheck => handlers::signal::handle_check(ctx, job).await,
        OperationType::SignalActivate => handlers::signal::handle_activate(ctx, job).await,
        OperationType::SignalRefresh => handlers::signal::handle_refresh(ctx, job).await,
        OperationType::StartInstallment => handlers::installment::handle_start(ctx, job).await,
        OperationType::ConfirmInstallment => handlers::installment::handle_confirm(ctx, job).await,
        OperationType::CheckAccountBalance => handlers::check_balance::handle(ctx, job).await,
    }
}
