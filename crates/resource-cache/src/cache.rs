//! [`ResourceCache`]: short-TTL memoization of per-card package lists and
//! STB (receiver) numbers (§4.4).
//!
//! Purely advisory: a miss costs a round trip to the upstream client, it
//! is never a correctness issue. Both namespaces are last-writer-wins,
//! which is safe because the cached payload always reflects the
//! upstream portal's current truth at write time.

use crate::error::ResourceCacheResult;
use serde::{Deserialize, Serialize};
use session_cache::SharedStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Package list TTL: the upstream catalog for a card rarely changes
/// within a session, but a successful purchase can shift what's on
/// offer, so this is short and explicitly invalidated on purchase.
pub const PACKAGE_TTL: Duration = Duration::from_secs(10 * 60);

/// STB (receiver) numbers are effectively static per card, so this can
/// be cached much longer.
pub const STB_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageOption {
    pub id: String,
    pub name: String,
    pub price: f64,
}

fn package_key(card: &str) -> String {
    format!("packages:{card}")
}

fn stb_key(card: &str) -> String {
    format!("stb:{card}")
}

pub struct ResourceCache {
    store: Arc<dyn SharedStore>,
}

impl ResourceCache {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn get_packages(&self, card: &str) -> ResourceCacheResult<Option<Vec<PackageOption>>> {
        match self.store.get(&package_key(card)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_packages(&self, card: &str, packages: &[PackageOption]) -> ResourceCacheResult<()> {
        let raw = serde_json::to_string(packages)?;
        self.store.set_ex(&package_key(card), &raw, PACKAGE_TTL).await?;
        debug!(%card, count = packages.len(), "cached package list");
        Ok(())
    }

    /// Invalidate a card's cached package list, e.g. after a successful
    /// purchase changes what's on offer.
    pub async fn invalidate_packages(&self, card: &str) -> ResourceCacheResult<()> {
        self.store.delete(&package_key(card)).await?;
        Ok(())
    }

    pub async fn get_stb(&self, card: &str) -> ResourceCacheResult<Option<String>> {
        Ok(self.store.get(&stb_key(card)).await?)
    }

    pub async fn put_stb(&self, card: &str, stb_number: &str) -> ResourceCacheResult<()> {
        self.store.set_ex(&stb_key(card), stb_number, STB_TTL).await?;
        Ok(())
    }
}
