//! Offline Cache
//!
//! TTL-bounded cache of fetched data on top of a [`DurableStore`], read
//! when the network is unavailable. Cache failures never reach the caller:
//! a read that fails is a miss and a write that fails returns `false`.

use crate::error::ResilienceError;
use crate::storage::DurableStore;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Key namespace: entries live under `cache_<namespace>_`
    pub namespace: String,
    /// TTL applied when `set` is called without one
    pub default_ttl_secs: u64,
    /// Period of the background sweeper
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "offline".to_string(),
            default_ttl_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// Stored form of a cached value. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub stored_at: i64,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Stored keys plus serialized values
    pub approximate_bytes: usize,
    /// Entries past their expiry that have not been swept yet
    pub expired: usize,
}

pub struct OfflineCache {
    store: Arc<dyn DurableStore>,
    prefix: String,
    default_ttl: Duration,
    sweep_interval: Duration,
}

impl OfflineCache {
    pub fn new(store: Arc<dyn DurableStore>, config: CacheConfig) -> Self {
        Self {
            store,
            prefix: format!("cache_{}_", config.namespace),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fresh value for `key`. Expired and undecodable entries are removed
    /// and reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let storage_key = self.storage_key(key);
        let bytes = match self.store.get(&storage_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                return None;
            }
        };

        let decoded = serde_json::from_slice::<CacheEntry>(&bytes)
            .ok()
            .filter(|entry| entry.is_fresh(now_ms()))
            .map(|entry| serde_json::from_value::<T>(entry.data));

        match decoded {
            Some(Ok(value)) => {
                debug!("Cache hit: {}", key);
                Some(value)
            }
            _ => {
                debug!("Cache miss (stale or unreadable): {}", key);
                if let Err(e) = self.store.delete(&storage_key).await {
                    warn!("Failed to evict {}: {}", key, e);
                }
                None
            }
        }
    }

    /// Store `data` for `ttl` (the default TTL when `None`). When the store
    /// is full, expired entries are swept and the write is retried once.
    /// Returns whether the value was stored.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Option<Duration>) -> bool {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cache value for {} is not serializable: {}", key, e);
                return false;
            }
        };
        let stored_at = now_ms();
        let ttl_ms = i64::try_from(ttl.unwrap_or(self.default_ttl).as_millis()).unwrap_or(i64::MAX);
        let entry = CacheEntry {
            data,
            stored_at,
            expires_at: stored_at.saturating_add(ttl_ms),
        };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode cache entry {}: {}", key, e);
                return false;
            }
        };

        let storage_key = self.storage_key(key);
        match self.store.set(&storage_key, bytes.clone()).await {
            Ok(()) => true,
            Err(ResilienceError::QuotaExceeded(reason)) => {
                let swept = self.clear_expired().await;
                info!(
                    "Cache full ({}), swept {} expired entries, retrying {}",
                    reason, swept, key
                );
                match self.store.set(&storage_key, bytes).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Cache write for {} failed after sweep: {}", key, e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Cache write for {} failed: {}", key, e);
                false
            }
        }
    }

    /// Drop one entry. Missing keys are ignored.
    pub async fn remove(&self, key: &str) {
        if let Err(e) = self.store.delete(&self.storage_key(key)).await {
            warn!("Failed to remove cache entry {}: {}", key, e);
        }
    }

    /// Delete every expired or unreadable entry. Returns how many were removed.
    ///
    /// Each candidate is re-read just before its delete and skipped when it
    /// changed after the scan, so an entry refreshed by a concurrent `set`
    /// survives the sweep.
    pub async fn clear_expired(&self) -> usize {
        let now = now_ms();
        let mut removed = 0;
        for (key, scanned) in self.scan().await {
            if !is_stale(&scanned, now) {
                continue;
            }
            match self.store.get(&key).await {
                Ok(Some(current)) if current == scanned => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!("Cache read failed for {}: {}", key, e);
                    continue;
                }
            }
            match self.store.delete(&key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to evict {}: {}", key, e),
            }
        }
        if removed > 0 {
            debug!("Cleared {} cache entries (expired)", removed);
        }
        removed
    }

    /// Delete every entry in this cache's namespace
    pub async fn clear_all(&self) -> usize {
        let keys = self.scan().await.into_iter().map(|(key, _)| key).collect();
        self.delete_keys(keys, "all").await
    }

    /// Entry count and size. Does not evict anything.
    pub async fn get_stats(&self) -> CacheStats {
        let now = now_ms();
        let entries = self.scan().await;
        CacheStats {
            entries: entries.len(),
            approximate_bytes: entries.iter().map(|(k, v)| k.len() + v.len()).sum(),
            expired: entries.iter().filter(|(_, bytes)| is_stale(bytes, now)).count(),
        }
    }

    /// Run [`clear_expired`](Self::clear_expired) every sweep interval until
    /// the cache is dropped or the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval.max(Duration::from_millis(1));
        info!("Starting cache sweeper (interval: {:?})", period);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.clear_expired().await;
                if removed > 0 {
                    info!("Cache sweep: removed {} expired entries", removed);
                }
            }
        })
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn scan(&self) -> Vec<(String, Vec<u8>)> {
        match self.store.scan_prefix(&self.prefix).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cache scan failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn delete_keys(&self, keys: Vec<String>, what: &str) -> usize {
        if keys.is_empty() {
            return 0;
        }
        match self.store.delete_many(&keys).await {
            Ok(()) => {
                debug!("Cleared {} cache entries ({})", keys.len(), what);
                keys.len()
            }
            Err(e) => {
                warn!("Failed to clear {} cache entries: {}", what, e);
                0
            }
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Expired, or not a cache entry at all
fn is_stale(bytes: &[u8], now_ms: i64) -> bool {
    serde_json::from_slice::<CacheEntry>(bytes)
        .map(|entry| !entry.is_fresh(now_ms))
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResilienceResult;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn cache_on(store: Arc<dyn DurableStore>) -> OfflineCache {
        OfflineCache::new(store, CacheConfig::default())
    }

    /// Memory store that writes `refresh` right after answering a scan, like
    /// a `set` racing a sweep
    struct RefreshAfterScan {
        inner: MemoryStore,
        refresh: parking_lot::Mutex<Option<(String, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl DurableStore for RefreshAfterScan {
        async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> ResilienceResult<()> {
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> ResilienceResult<()> {
            self.inner.delete(key).await
        }

        async fn delete_many(&self, keys: &[String]) -> ResilienceResult<()> {
            self.inner.delete_many(keys).await
        }

        async fn scan_prefix(&self, prefix: &str) -> ResilienceResult<Vec<(String, Vec<u8>)>> {
            let entries = self.inner.scan_prefix(prefix).await?;
            let refresh = self.refresh.lock().take();
            if let Some((key, value)) = refresh {
                self.inner.set(&key, value).await?;
            }
            Ok(entries)
        }

        fn name(&self) -> &'static str {
            "refresh-after-scan"
        }
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let cache = cache_on(Arc::new(MemoryStore::new()));
        assert!(cache.set("user", &json!({"name": "ada"}), None).await);

        let value: Value = cache.get("user").await.unwrap();
        assert_eq!(value["name"], "ada");

        cache.remove("user").await;
        cache.remove("user").await;
        assert!(cache.get::<Value>("user").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted_on_read() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone());
        assert!(cache.set("k", &1u32, Some(Duration::ZERO)).await);
        assert_eq!(store.len(), 1);

        assert_eq!(cache.get::<u32>("k").await, None);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store.set("cache_offline_bad", b"{not json".to_vec()).await.unwrap();
        let cache = cache_on(store.clone());

        assert_eq!(cache.get::<Value>("bad").await, None);
        assert!(store.is_empty());

        // Wrong shape for the requested type
        assert!(cache.set("n", &"text", None).await);
        assert_eq!(cache.get::<u64>("n").await, None);
    }

    #[tokio::test]
    async fn test_clear_expired_is_idempotent_and_scoped() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone());
        let other = OfflineCache::new(
            store.clone(),
            CacheConfig {
                namespace: "other".to_string(),
                ..CacheConfig::default()
            },
        );
        store.set("sync_states:tasks", b"{}".to_vec()).await.unwrap();

        cache.set("old", &1, Some(Duration::ZERO)).await;
        cache.set("new", &2, None).await;
        other.set("old", &3, Some(Duration::ZERO)).await;

        let stats = cache.get_stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.expired, 1);
        assert!(stats.approximate_bytes > 0);

        assert_eq!(cache.clear_expired().await, 1);
        assert_eq!(cache.clear_expired().await, 0);
        assert_eq!(other.get_stats().await.entries, 1);

        assert_eq!(cache.clear_all().await, 1);
        assert!(store.get("sync_states:tasks").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_quota_triggers_one_sweep_and_retry() {
        let store = Arc::new(MemoryStore::with_quota(400));
        let cache = cache_on(store.clone());

        assert!(cache.set("stale", &"x".repeat(200), Some(Duration::ZERO)).await);
        // Does not fit next to the stale entry, fits once it is swept
        assert!(cache.set("fresh", &"y".repeat(200), None).await);
        assert_eq!(cache.get::<String>("fresh").await.unwrap().len(), 200);

        // Too big even for an empty store
        assert!(!cache.set("huge", &"z".repeat(1000), None).await);
    }

    #[tokio::test]
    async fn test_sweep_keeps_entry_refreshed_after_scan() {
        let store = Arc::new(RefreshAfterScan {
            inner: MemoryStore::new(),
            refresh: parking_lot::Mutex::new(None),
        });
        let cache = cache_on(store.clone());
        assert!(cache.set("session", &"old", Some(Duration::ZERO)).await);
        assert!(cache.set("gone", &"old", Some(Duration::ZERO)).await);

        let fresh = CacheEntry {
            data: json!("new"),
            stored_at: now_ms(),
            expires_at: now_ms() + 60_000,
        };
        *store.refresh.lock() = Some((
            "cache_offline_session".to_string(),
            serde_json::to_vec(&fresh).unwrap(),
        ));

        assert_eq!(cache.clear_expired().await, 1);
        assert_eq!(cache.get::<String>("session").await.as_deref(), Some("new"));
        assert_eq!(cache.get::<String>("gone").await, None);
    }
}
