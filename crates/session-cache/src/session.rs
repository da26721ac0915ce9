//! The authenticated upstream session record (§3 Session) and the cache
//! built on top of [`SharedStore`] (§4.1).

use serde::{Deserialize, Serialize};

/// Opaque upstream authentication state: a cookie jar plus the
/// WebForms view-state blob, with a derived expiry. A session with
/// `expires_at <= now` is treated as absent (the invariant named in §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub cookies: String,
    pub view_state: String,
    pub expires_at: i64,
    pub login_timestamp: i64,
}

impl Session {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}
