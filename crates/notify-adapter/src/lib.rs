//! Thin binding interface to the external user/admin notification system
//! (§2 "Refund/Notification adapters"). Notification delivery is out of
//! scope per §1 Non-goals, so this crate ships the [`Notifier`] trait, a
//! logging-backed default implementation, and an in-memory recorder for
//! tests.

mod fake;
mod logging;
mod notifier;

pub use fake::{RecordedNotification, RecordingNotifier};
pub use logging::LoggingNotifier;
pub use notifier::Notifier;
