//! Upstream dealer-portal client interface (§4.5).
//!
//! Deliberately abstract: any concrete implementation honoring the
//! [`UpstreamClient`] contract is acceptable. No HTTP/WebForms
//! implementation is included; this crate ships the trait plus an
//! in-memory scripted fake for tests.

mod client;
mod error;
mod fake;
mod types;

pub use client::UpstreamClient;
pub use error::{UpstreamError, UpstreamResult};
pub use fake::ScriptedUpstreamClient;
pub use types::{
    CompletePurchaseResult, ConfirmResult, InstallmentResult, LoadPackagesResult, LoginResult,
    PayInstallmentResult, SignalResult,
};
