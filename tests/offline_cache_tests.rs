//! Offline Cache Tests
//!
//! Verifies TTL freshness, persistence across restart, background sweeping
//! and namespace isolation from the sync manager.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use steadylink::cache::{CacheConfig, OfflineCache};
use steadylink::storage::{DurableStore, MemoryStore, RocksStore};
use steadylink::sync::{ChangeOperation, DeltaSyncManager, SyncConfig};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    visits: u32,
}

#[tokio::test]
async fn test_entry_expires_after_ttl() {
    let cache = OfflineCache::new(Arc::new(MemoryStore::new()), CacheConfig::default());
    let profile = Profile {
        name: "ada".to_string(),
        visits: 3,
    };

    assert!(cache.set("profile", &profile, Some(Duration::from_millis(100))).await);
    assert_eq!(cache.get::<Profile>("profile").await, Some(profile));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.get::<Profile>("profile").await, None);
    assert_eq!(cache.get_stats().await.entries, 0);
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    {
        let store = Arc::new(RocksStore::open(tmp_dir.path()).unwrap());
        let cache = OfflineCache::new(store, CacheConfig::default());
        assert!(cache.set("feed", &json!([1, 2, 3]), None).await);
    }

    let store = Arc::new(RocksStore::open(tmp_dir.path()).unwrap());
    let cache = OfflineCache::new(store, CacheConfig::default());
    assert_eq!(cache.get::<Vec<u32>>("feed").await, Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn test_sweeper_removes_expired_entries() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(OfflineCache::new(
        store.clone(),
        CacheConfig {
            sweep_interval_secs: 1,
            ..CacheConfig::default()
        },
    ));

    cache.set("short", &1, Some(Duration::from_millis(10))).await;
    cache.set("long", &2, None).await;
    let sweeper = cache.spawn_sweeper();

    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(store.len(), 1);
    assert_eq!(cache.get::<i32>("long").await, Some(2));

    sweeper.abort();
}

#[tokio::test]
async fn test_cache_and_sync_share_a_store() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let cache = OfflineCache::new(store.clone(), CacheConfig::default());
    let sync = DeltaSyncManager::open(store.clone(), SyncConfig::default())
        .await
        .unwrap();

    sync.queue_change("tasks", ChangeOperation::Insert, json!({"a": 1}), "1")
        .await
        .unwrap();
    cache.set("tasks", &json!(["cached"]), None).await;

    assert_eq!(cache.clear_all().await, 1);
    assert_eq!(sync.get_pending_changes("tasks").await.unwrap().len(), 1);
}
