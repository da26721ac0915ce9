//! In-memory [`Notifier`] fake for assertions in handler tests (§2.1
//! Test tooling): records every call instead of emitting it anywhere.

use crate::notifier::Notifier;
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedNotification {
    User { user_id: String, message: String },
    Admins { subject: String, message: String },
    LowBalance { account_id: String, balance: f64, threshold: f64 },
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<RecordedNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<RecordedNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user(&self, user_id: &str, message: &str) {
        self.sent.lock().unwrap().push(RecordedNotification::User {
            user_id: user_id.to_string(),
            message: message.to_string(),
        });
    }

    async fn notify_admins(&self, subject: &str, message: &str) {
        self.sent.lock().unwrap().push(RecordedNotification::Admins {
            subject: subject.to_string(),
            message: message.to_string(),
        });
    }

    async fn notify_low_balance(&self, account_id: &str, balance: f64, threshold: f64) {
        self.sent.lock().unwrap().push(RecordedNotification::LowBalance {
            account_id: account_id.to_string(),
            balance,
            threshold,
        });
    }
}
