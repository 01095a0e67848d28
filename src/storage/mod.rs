//! Durable key-value storage
//!
//! The persistence capability shared by the offline cache and the delta sync
//! manager. Each component writes under its own key namespace, so no
//! cross-component locking is needed.
//!
//! Adapters:
//! - [`MemoryStore`] - in-process map with an optional byte quota
//! - [`RocksStore`] - RocksDB, atomic multi-delete through `WriteBatch`
//! - [`SqliteStore`] - SQLite, atomic multi-delete through a transaction

mod memory;
mod rocks;
mod sqlite;

pub use memory::MemoryStore;
pub use rocks::RocksStore;
pub use sqlite::SqliteStore;

use crate::error::ResilienceResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Abstract durable store.
///
/// Values are opaque bytes; callers in this crate store JSON.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a value, `None` when the key is absent
    async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>>;

    /// Insert or overwrite a value. Must be persisted when this returns.
    async fn set(&self, key: &str, value: Vec<u8>) -> ResilienceResult<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> ResilienceResult<()>;

    /// Remove several keys in one atomic step: either every key is gone
    /// afterwards or none of them is.
    async fn delete_many(&self, keys: &[String]) -> ResilienceResult<()>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> ResilienceResult<Vec<(String, Vec<u8>)>>;

    /// Short adapter name for log lines
    fn name(&self) -> &'static str;
}

/// Read and decode a JSON value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> ResilienceResult<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> ResilienceResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}
