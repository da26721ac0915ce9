//! Default [`Notifier`] implementation: routes every notification
//! through structured logging rather than a real delivery channel,
//! matching the "interfaces only" scope for notification delivery.

use crate::notifier::Notifier;
use async_trait::async_trait;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_user(&self, user_id: &str, message: &str) {
        info!(%user_id, message, "user notification");
    }

    async fn notify_admins(&self, subject: &str, message: &str) {
        warn!(subject, message, "admin notification");
    }

    async fn notify_low_balance(&self, account_id: &str, balance: f64, threshold: f64) {
        warn!(%account_id, balance, threshold, "dealer account balance below threshold");
    }
}
