//! [`UpstreamClient`]: the dealer-portal capability interface (§4.5).
//!
//! Deliberately abstract — any implementation that honors these
//! contracts, including returning a structured session-expired failure
//! from [`UpstreamClient::load_packages`] rather than throwing, is
//! acceptable. This workspace ships the trait and an in-memory scripted
//! fake; no HTTP/WebForms implementation is included.

use crate::error::UpstreamResult;
use crate::types::{
    CompletePurchaseResult, ConfirmResult, InstallmentResult, LoadPackagesResult, LoginResult,
    PayInstallmentResult, SignalResult,
};
use async_trait::async_trait;
use session_cache::Session;
use std::time::Duration;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn login(&mut self, user: &str, pass: &str, totp: Option<&str>) -> UpstreamResult<LoginResult>;

    async fn submit_login(
        &mut self,
        user: &str,
        pass: &str,
        totp: Option<&str>,
        captcha_solution: &str,
    ) -> UpstreamResult<LoginResult>;

    async fn validate_session(&self) -> UpstreamResult<bool>;

    /// Returns the STB (receiver) number for a card; failure is non-fatal
    /// to callers per §4.6 step 4.
    async fn check_card(&self, card: &str) -> UpstreamResult<Option<String>>;

    async fn load_packages(&self, card: &str, smartcard_type: &str) -> UpstreamResult<LoadPackagesResult>;

    async fn complete_purchase(
        &mut self,
        package_id: &str,
        promo: Option<&str>,
        stb: Option<&str>,
        skip_final_click: bool,
    ) -> UpstreamResult<CompletePurchaseResult>;

    async fn confirm_purchase(&mut self) -> UpstreamResult<ConfirmResult>;

    async fn cancel_purchase(&mut self) -> UpstreamResult<()>;

    async fn activate_signal(&mut self, card: &str) -> UpstreamResult<SignalResult>;

    async fn check_card_for_signal(&mut self, card: &str) -> UpstreamResult<SignalResult>;

    async fn activate_signal_only(&mut self, card: &str) -> UpstreamResult<SignalResult>;

    async fn load_installment(&mut self, card: &str) -> UpstreamResult<InstallmentResult>;

    async fn pay_installment(&mut self) -> UpstreamResult<PayInstallmentResult>;

    fn export_session(&self) -> Option<Session>;

    fn import_session(&mut self, session: Session);

    fn is_session_active(&self) -> bool;

    fn get_session_timeout(&self) -> Duration;

    /// Probes current upstream balance using a known-good card, used by
    /// `CHECK_ACCOUNT_BALANCE`.
    async fn fetch_dealer_balance(&self, probe_card: &str) -> UpstreamResult<f64>;
}
