//! The [`Notifier`] trait: a thin binding interface to the external
//! user/admin notification system. Notification delivery is out of
//! scope per §1 Non-goals ("interfaces only"), so this crate ships the
//! trait plus a logging default — any real delivery channel (email,
//! push, Slack) is a separate concrete implementation.

use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Inform a user their operation reached a terminal or user-visible
    /// state, e.g. `AWAITING_FINAL_CONFIRM`, `COMPLETED`, `FAILED`.
    async fn notify_user(&self, user_id: &str, message: &str);

    /// Inform operators of a condition requiring attention, e.g. a
    /// dealer account's upstream balance falling short of a purchase.
    async fn notify_admins(&self, subject: &str, message: &str);

    /// A dealer account's upstream balance dropped below the configured
    /// threshold during a keep-alive refresh cycle (§4.7).
    async fn notify_low_balance(&self, account_id: &str, balance: f64, threshold: f64);
}
