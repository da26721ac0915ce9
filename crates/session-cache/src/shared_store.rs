//! The `SharedStore` trait (§4.1 implementation note): a small async
//! contract over the primitives the Session Cache, Account Pool, Queue
//! Manager, and Package/STB Cache all need from the shared key-value
//! store. Production code is generic over this trait rather than hard-
//! coding a Redis client, so a single in-memory double can stand in for
//! every shared-store-backed component in tests (§2.1 Test tooling).
//!
//! The primitives are deliberately few and map directly onto the
//! operations named in §4 and §6: TTL-keyed get/set, atomic
//! set-if-absent (account lease acquisition, login lock acquisition),
//! compare-and-delete (login lock release, lease release), conditional
//! TTL refresh (`extend`), and a FIFO list (the account queue).

use crate::error::StoreResult;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Plain read. Returns `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditional write with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomic set-if-absent with a TTL. Returns `true` iff this call set
    /// the key (i.e. the caller now owns whatever the key represents:
    /// a lease, a login lock).
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Unconditional delete. Returns `true` iff a key was actually removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Compare-and-delete: removes `key` only if its current value equals
    /// `expected`. Returns `true` iff the delete happened. This is the
    /// mechanism behind "only the owning worker releases" (login lock,
    /// lease release).
    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Refresh a key's TTL only if it still exists; a no-op otherwise.
    /// Returns `true` iff the key existed and its TTL was refreshed.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Whether `key` is currently present (and unexpired).
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Append `value` to the tail of the FIFO list at `key`.
    async fn rpush(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Peek (without removing) the element at the head of the FIFO list.
    async fn lpeek_front(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remove the first occurrence of `value` from the list at `key`.
    async fn lrem(&self, key: &str, value: &str) -> StoreResult<()>;
}
