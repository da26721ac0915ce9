//! In-process [`SharedStore`] double used by component tests across the
//! workspace in place of a live Redis instance (§2.1 Test tooling).

use crate::error::StoreResult;
use crate::shared_store::SharedStore;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    scalars: Mutex<HashMap<String, Entry>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut scalars = self.scalars.lock().await;
        match scalars.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                scalars.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut scalars = self.scalars.lock().await;
        scalars.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut scalars = self.scalars.lock().await;
        if let Some(entry) = scalars.get(key) {
            if entry.is_live(now) {
                return Ok(false);
            }
        }
        scalars.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut scalars = self.scalars.lock().await;
        Ok(scalars.remove(key).is_some())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut scalars = self.scalars.lock().await;
        match scalars.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                scalars.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut scalars = self.scalars.lock().await;
        match scalars.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            Some(_) => {
                scalars.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut lists = self.lists.lock().await;
        lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lpeek_front(&self, key: &str) -> StoreResult<Option<String>> {
        let lists = self.lists.lock().await;
        Ok(lists.get(key).and_then(|q| q.front().cloned()))
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut lists = self.lists.lock().await;
        if let Some(queue) = lists.get_mut(key) {
            if let Some(pos) = queue.iter().position(|v| v == value) {
                queue.remove(pos);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_ex_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("k", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx_ex("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_if_eq_only_removes_matching_value() {
        let store = MemoryStore::new();
        store.set_ex("k", "owner-1", Duration::from_secs(5)).await.unwrap();
        assert!(!store.delete_if_eq("k", "owner-2").await.unwrap());
        assert!(store.delete_if_eq("k", "owner-1").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_is_noop_when_absent() {
        let store = MemoryStore::new();
        assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn fifo_list_preserves_enqueue_order() {
        let store = MemoryStore::new();
        store.rpush("q", "a").await.unwrap();
        store.rpush("q", "b").await.unwrap();
        assert_eq!(store.lpeek_front("q").await.unwrap().as_deref(), Some("a"));
        store.lrem("q", "a").await.unwrap();
        assert_eq!(store.lpeek_front("q").await.unwrap().as_deref(), Some("b"));
    }
}
