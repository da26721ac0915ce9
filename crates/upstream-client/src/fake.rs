//! An in-memory scripted [`UpstreamClient`] fake for job-processor and
//! component tests (§2.1 Test tooling): the upstream client is treated
//! as interface-only, so its test double lives alongside the trait
//! rather than behind a separate mocking framework.

use crate::client::UpstreamClient;
use crate::error::{UpstreamError, UpstreamResult};
use crate::types::{
    CompletePurchaseResult, ConfirmResult, InstallmentResult, LoadPackagesResult, LoginResult,
    PayInstallmentResult, SignalResult,
};
use async_trait::async_trait;
use session_cache::Session;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Queues of canned responses, consumed in call order. A method whose
/// queue is empty returns `UpstreamError::Transient` so a missing script
/// entry fails loudly rather than silently succeeding.
#[derive(Default)]
pub struct ScriptedUpstreamClient {
    session: Mutex<Option<Session>>,
    logins: Mutex<VecDeque<UpstreamResult<LoginResult>>>,
    validate_session: Mutex<VecDeque<UpstreamResult<bool>>>,
    check_card: Mutex<VecDeque<UpstreamResult<Option<String>>>>,
    load_packages: Mutex<VecDeque<UpstreamResult<LoadPackagesResult>>>,
    complete_purchase: Mutex<VecDeque<UpstreamResult<CompletePurchaseResult>>>,
    confirm_purchase: Mutex<VecDeque<UpstreamResult<ConfirmResult>>>,
    cancel_purchase: Mutex<VecDeque<UpstreamResult<()>>>,
    signal: Mutex<VecDeque<UpstreamResult<SignalResult>>>,
    installment: Mutex<VecDeque<UpstreamResult<InstallmentResult>>>,
    pay_installment: Mutex<VecDeque<UpstreamResult<PayInstallmentResult>>>,
    dealer_balance: Mutex<VecDeque<UpstreamResult<f64>>>,
    session_timeout: Duration,
}

fn pop_or_transient<T>(queue: &Mutex<VecDeque<UpstreamResult<T>>>) -> UpstreamResult<T> {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(UpstreamError::Transient("no scripted response queued".into())))
}

impl ScriptedUpstreamClient {
    pub fn new() -> Self {
        Self {
            session_timeout: Duration::from_secs(15 * 60),
            ..Default::default()
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn queue_login(&self, result: UpstreamResult<LoginResult>) {
        self.logins.lock().unwrap().push_back(result);
    }

    pub fn queue_validate_session(&self, result: UpstreamResult<bool>) {
        self.validate_session.lock().unwrap().push_back(result);
    }

    pub fn queue_check_card(&self, result: UpstreamResult<Option<String>>) {
        self.check_card.lock().unwrap().push_back(result);
    }

    pub fn queue_load_packages(&self, result: UpstreamResult<LoadPackagesResult>) {
        self.load_packages.lock().unwrap().push_back(result);
    }

    pub fn queue_complete_purchase(&self, result: UpstreamResult<CompletePurchaseResult>) {
        self.complete_purchase.lock().unwrap().push_back(result);
    }

    pub fn queue_confirm_purchase(&self, result: UpstreamResult<ConfirmResult>) {
        self.confirm_purchase.lock().unwrap().push_back(result);
    }

    pub fn queue_cancel_purchase(&self, result: UpstreamResult<()>) {
        self.cancel_purchase.lock().unwrap().push_back(result);
    }

    pub fn queue_signal(&self, result: UpstreamResult<SignalResult>) {
        self.signal.lock().unwrap().push_back(result);
    }

    pub fn queue_installment(&self, result: UpstreamResult<InstallmentResult>) {
        self.installment.lock().unwrap().push_back(result);
    }

    pub fn queue_pay_installment(&self, result: UpstreamResult<PayInstallmentResult>) {
        self.pay_installment.lock().unwrap().push_back(result);
    }

    pub fn queue_dealer_balance(&self, result: UpstreamResult<f64>) {
        self.dealer_balance.lock().unwrap().push_back(result);
    }

    /// Simulate what a real client does on successful login: populate the
    /// internal session from whatever the (fake) login exchange produced.
    /// A no-op if a session was already imported, so callers that pre-seed
    /// a session via `import_session` keep full control of its contents.
    fn establish_session(&self) {
        let mut session = self.session.lock().unwrap();
        if session.is_none() {
            let now = chrono::Utc::now().timestamp();
            *session = Some(Session {
                cookies: "scripted-cookie-jar".into(),
                view_state: "scripted-view-state".into(),
                expires_at: now + self.session_timeout.as_secs() as i64,
                login_timestamp: now,
            });
        }
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstreamClient {
    async fn login(&mut self, _user: &str, _pass: &str, _totp: Option<&str>) -> UpstreamResult<LoginResult> {
        let result = pop_or_transient(&self.logins)?;
        if result.success {
            self.establish_session();
        }
        Ok(result)
    }

    async fn submit_login(
        &mut self,
        _user: &str,
        _pass: &str,
        _totp: Option<&str>,
        _captcha_solution: &str,
    ) -> UpstreamResult<LoginResult> {
        let result = pop_or_transient(&self.logins)?;
        if result.success {
            self.establish_session();
        }
        Ok(result)
    }

    async fn validate_session(&self) -> UpstreamResult<bool> {
        pop_or_transient(&self.validate_session)
    }

    async fn check_card(&self, _card: &str) -> UpstreamResult<Option<String>> {
        pop_or_transient(&self.check_card)
    }

    async fn load_packages(&self, _card: &str, _smartcard_type: &str) -> UpstreamResult<LoadPackagesResult> {
        pop_or_transient(&self.load_packages)
    }

    async fn complete_purchase(
        &mut self,
        _package_id: &str,
        _promo: Option<&str>,
        _stb: Option<&str>,
        _skip_final_click: bool,
    ) -> UpstreamResult<CompletePurchaseResult> {
        pop_or_transient(&self.complete_purchase)
    }

    async fn confirm_purchase(&mut self) -> UpstreamResult<ConfirmResult> {
        pop_or_transient(&self.confirm_purchase)
    }

    async fn cancel_purchase(&mut self) -> UpstreamResult<()> {
        pop_or_transient(&self.cancel_purchase)
    }

    async fn activate_signal(&mut self, _card: &str) -> UpstreamResult<SignalResult> {
        pop_or_transient(&self.signal)
    }

    async fn check_card_for_signal(&mut self, _card: &str) -> UpstreamResult<SignalResult> {
        pop_or_transient(&self.signal)
    }

    async fn activate_signal_only(&mut self, _card: &str) -> UpstreamResult<SignalResult> {
        pop_or_transient(&self.signal)
    }

    async fn load_installment(&mut self, _card: &str) -> UpstreamResult<InstallmentResult> {
        pop_or_transient(&self.installment)
    }

    async fn pay_installment(&mut self) -> UpstreamResult<PayInstallmentResult> {
        pop_or_transient(&self.pay_installment)
    }

    fn export_session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    fn import_session(&mut self, session: Session) {
        *self.session.lock().unwrap() = Some(session);
    }

    fn is_session_active(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    fn get_session_timeout(&self) -> Duration {
        self.session_timeout
    }

    async fn fetch_dealer_balance(&self, _probe_card: &str) -> UpstreamResult<f64> {
        pop_or_transient(&self.dealer_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn login_returns_queued_result_in_order() {
        let mut client = ScriptedUpstreamClient::new();
        client.queue_login(Ok(LoginResult::captcha_required("img-1")));
        client.queue_login(Ok(LoginResult::success()));

        let first = client.login("u", "p", None).await.unwrap();
        assert!(first.requires_captcha);

        let second = client.login("u", "p", None).await.unwrap();
        assert!(second.success);
    }

    #[tokio::test]
    async fn empty_queue_fails_loudly() {
        let mut client = ScriptedUpstreamClient::new();
        let err = client.login("u", "p", None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Transient(_)));
    }

    #[tokio::test]
    async fn session_export_import_round_trips() {
        let mut client = ScriptedUpstreamClient::new();
        assert!(!client.is_session_active());
        let session = Session {
            cookies: "c".into(),
            view_state: "v".into(),
            expires_at: 1000,
            login_timestamp: 0,
        };
        client.import_session(session.clone());
        assert!(client.is_session_active());
        assert_eq!(client.export_session(), Some(session));
    }
}
