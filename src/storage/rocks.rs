use super::DurableStore;
use crate::error::{ResilienceError, ResilienceResult};
use async_trait::async_trait;
use rocksdb::{Options, WriteBatch, WriteOptions, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Durable store backed by RocksDB. Every operation runs on the blocking
/// thread pool.
pub struct RocksStore {
    db: Arc<DB>,
    path: PathBuf,
    sync_writes: bool,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.path)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl RocksStore {
    /// Open or create a store in `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> ResilienceResult<Self> {
        let path = data_dir.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Keep the WAL bounded, this store only holds client-side state
        opts.set_max_total_wal_size(16 * 1024 * 1024);
        opts.set_keep_log_file_num(3);

        let db = DB::open(&opts, &path)
            .map_err(|e| ResilienceError::Storage(format!("Failed to open RocksDB: {}", e)))?;

        tracing::debug!("RocksStore opened at {}", path.display());

        Ok(Self {
            db: Arc::new(db),
            path,
            sync_writes: false,
        })
    }

    /// fsync the WAL on every write. Without it writes survive a process
    /// crash but not an OS crash.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_options(sync_writes: bool) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(sync_writes);
        opts
    }

    fn map_write_error(key: &str, err: rocksdb::Error) -> ResilienceError {
        let message = err.into_string();
        if message.contains("No space") || message.contains("NoSpace") {
            ResilienceError::QuotaExceeded(format!("{}: {}", key, message))
        } else {
            ResilienceError::Storage(message)
        }
    }

    async fn blocking<T, F>(&self, op: F) -> ResilienceResult<T>
    where
        F: FnOnce(&DB, WriteOptions) -> ResilienceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let sync_writes = self.sync_writes;
        tokio::task::spawn_blocking(move || op(&db, Self::write_options(sync_writes))).await?
    }
}

#[async_trait]
impl DurableStore for RocksStore {
    async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking(move |db, _| Ok(db.get(key.as_bytes())?)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> ResilienceResult<()> {
        let key = key.to_string();
        self.blocking(move |db, opts| {
            db.put_opt(key.as_bytes(), value, &opts)
                .map_err(|e| Self::map_write_error(&key, e))
        })
        .await
    }

    async fn delete(&self, key: &str) -> ResilienceResult<()> {
        let key = key.to_string();
        self.blocking(move |db, opts| {
            db.delete_opt(key.as_bytes(), &opts)
                .map_err(|e| Self::map_write_error(&key, e))
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> ResilienceResult<()> {
        let keys = keys.to_vec();
        self.blocking(move |db, opts| {
            let mut batch = WriteBatch::default();
            for key in &keys {
                batch.delete(key.as_bytes());
            }
            db.write_opt(batch, &opts)
                .map_err(|e| Self::map_write_error("batch", e))
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> ResilienceResult<Vec<(String, Vec<u8>)>> {
        let prefix = prefix.to_string();
        self.blocking(move |db, _| {
            let mut out = Vec::new();
            for item in db.prefix_iterator(prefix.as_bytes()) {
                let (key, value) = item?;
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                let key = String::from_utf8(key.to_vec())
                    .map_err(|e| ResilienceError::Storage(format!("Non UTF-8 key: {}", e)))?;
                out.push((key, value.to_vec()));
            }
            Ok(out)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "rocksdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = RocksStore::open(tmp.path()).unwrap().with_sync_writes(true);
            store.set("k", b"v".to_vec()).await.unwrap();
        }

        let store = RocksStore::open(tmp.path()).unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_scan_stops_at_prefix_boundary() {
        let tmp = TempDir::new().unwrap();
        let store = RocksStore::open(tmp.path()).unwrap();
        store.set("a:1", vec![1]).await.unwrap();
        store.set("a:2", vec![2]).await.unwrap();
        store.set("b:1", vec![3]).await.unwrap();

        let found = store.scan_prefix("a:").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(store.scan_prefix("c:").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_share_the_db() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(tmp.path()).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.set(&format!("w:{}", i), vec![i as u8]).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(store.scan_prefix("w:").await.unwrap().len(), 8);
        let keys: Vec<String> = (0..4).map(|i| format!("w:{}", i)).collect();
        store.delete_many(&keys).await.unwrap();
        assert_eq!(store.scan_prefix("w:").await.unwrap().len(), 4);
    }
}
