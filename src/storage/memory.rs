use super::DurableStore;
use crate::error::{ResilienceError, ResilienceResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Default)]
struct Entries {
    map: BTreeMap<String, Vec<u8>>,
    bytes: usize,
}

/// In-process store.
///
/// With a quota set, a write that would push the total key+value size over
/// the limit is rejected with [`ResilienceError::QuotaExceeded`], the same
/// way a browser or mobile key-value store rejects writes when full.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<Entries>,
    max_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses writes beyond `max_bytes`
    pub fn with_quota(max_bytes: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            max_bytes: Some(max_bytes),
        }
    }

    /// Current total size of keys and values
    pub fn used_bytes(&self) -> usize {
        self.entries.read().bytes
    }

    pub fn len(&self) -> usize {
        self.entries.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>> {
        Ok(self.entries.read().map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> ResilienceResult<()> {
        let mut entries = self.entries.write();
        let replaced = entries
            .map
            .get(key)
            .map(|old| key.len() + old.len())
            .unwrap_or(0);
        let projected = entries.bytes - replaced + key.len() + value.len();

        if let Some(max) = self.max_bytes {
            if projected > max {
                return Err(ResilienceError::QuotaExceeded(format!(
                    "writing '{}' needs {} bytes, quota is {}",
                    key, projected, max
                )));
            }
        }

        entries.map.insert(key.to_string(), value);
        entries.bytes = projected;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ResilienceResult<()> {
        let mut entries = self.entries.write();
        if let Some(old) = entries.map.remove(key) {
            entries.bytes -= key.len() + old.len();
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> ResilienceResult<()> {
        // A single write guard makes the whole removal one step for readers
        let mut entries = self.entries.write();
        for key in keys {
            if let Some(old) = entries.map.remove(key) {
                entries.bytes -= key.len() + old.len();
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> ResilienceResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries
            .map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
