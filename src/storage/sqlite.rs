//! SQLite-backed durable store
//!
//! One `kv` table keyed by string. Multi-key deletes run inside a single
//! transaction so a failure rolls the whole batch back. Queries run on the
//! blocking thread pool and the connection lock is only taken there.

use super::DurableStore;
use crate::error::ResilienceResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> ResilienceResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a store in the default location (user data directory)
    pub fn open_default(app_name: &str) -> ResilienceResult<Self> {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
            })
            .join(app_name);

        std::fs::create_dir_all(&data_dir)?;
        Self::open(data_dir.join("steadylink.db"))
    }

    /// In-memory database, mostly useful in tests
    pub fn open_in_memory() -> ResilienceResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> ResilienceResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> ResilienceResult<T>
    where
        F: FnOnce(&mut Connection) -> ResilienceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&mut conn.lock())).await?
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> ResilienceResult<()> {
        let key = key.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> ResilienceResult<()> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> ResilienceResult<()> {
        let keys = keys.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM kv WHERE key = ?1")?;
                for key in &keys {
                    stmt.execute(params![key])?;
                }
            }
            // Dropping `tx` on an early return above rolls everything back
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> ResilienceResult<Vec<(String, Vec<u8>)>> {
        let prefix = prefix.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )?;

            let rows = stmt.query_map(params![prefix], |row| {
                let key: String = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                Ok((key, value))
            })?;

            let entries = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
