//! Common test utilities
//!
//! Provides scripted collaborators for the integration tests:
//! - A transport that records call order and concurrency
//! - An in-memory sync backend and local replica
//! - A store whose multi-delete can be made to fail
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steadylink::network::{RequestOptions, Transport, TransportResponse};
use steadylink::storage::{DurableStore, MemoryStore};
use steadylink::sync::{
    ChangeOperation, DeltaChange, DeltaQueryParams, DeltaResponse, DeltaSyncManager, LocalReplica,
    SyncBackend,
};
use steadylink::{ResilienceError, ResilienceResult};
use tokio::sync::Semaphore;

/// Transport with behavior picked by target:
/// - `/block...` waits until [`release`](Self::release) is called
/// - `/fail...` returns a transport error
/// - `/slow...` sleeps for a second
/// - `.../delta...` answers with an empty sync delta
/// - anything else succeeds after `delay`
pub struct ScriptedTransport {
    delay: Duration,
    log: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    gate: Semaphore,
}

impl ScriptedTransport {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            log: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        })
    }

    /// Let one blocked call finish
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Targets in the order their attempts started
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn call_count(&self, target: &str) -> usize {
        self.log.lock().iter().filter(|t| *t == target).count()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, target: &str, _options: &RequestOptions) -> ResilienceResult<TransportResponse> {
        self.log.lock().push(target.to_string());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = if target.starts_with("/block") {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(TransportResponse::ok(json!({ "target": target })))
        } else if target.starts_with("/fail") {
            tokio::time::sleep(self.delay).await;
            Err(ResilienceError::Transport("connection refused".to_string()))
        } else if target.starts_with("/slow") {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(TransportResponse::ok(json!({ "target": target })))
        } else if target.contains("/delta") {
            tokio::time::sleep(self.delay).await;
            Ok(TransportResponse::ok(json!({
                "records": [],
                "version": 0,
                "checksum": DeltaSyncManager::generate_checksum(Vec::<String>::new()),
                "server_time": chrono::Utc::now(),
            })))
        } else {
            tokio::time::sleep(self.delay).await;
            Ok(TransportResponse::ok(json!({ "target": target })))
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Backend holding one record map per table
#[derive(Default)]
pub struct InMemoryBackend {
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    pushed_batches: Mutex<Vec<Vec<DeltaChange>>>,
    queries: Mutex<Vec<DeltaQueryParams>>,
    version: AtomicU64,
    /// Fail every push once this many batches were accepted
    fail_after_batches: Mutex<Option<usize>>,
    /// Report a checksum that cannot match
    corrupt_checksum: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_after_batches(&self, batches: usize) {
        *self.fail_after_batches.lock() = Some(batches);
    }

    pub fn corrupt_checksum(&self, corrupt: bool) {
        self.corrupt_checksum.store(corrupt, Ordering::SeqCst);
    }

    /// Record written directly on the server side
    pub fn insert_remote(&self, table: &str, id: &str, record: Value) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), record);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_ids(&self, table: &str) -> Vec<String> {
        self.tables
            .lock()
            .get(table)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pushed_batches(&self) -> Vec<Vec<DeltaChange>> {
        self.pushed_batches.lock().clone()
    }

    pub fn queries(&self) -> Vec<DeltaQueryParams> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl SyncBackend for InMemoryBackend {
    async fn push_changes(&self, table: &str, changes: &[DeltaChange]) -> ResilienceResult<()> {
        if let Some(limit) = *self.fail_after_batches.lock() {
            if self.pushed_batches.lock().len() >= limit {
                return Err(ResilienceError::HttpStatus {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
        }

        let mut tables = self.tables.lock();
        let records = tables.entry(table.to_string()).or_default();
        for change in changes {
            match change.operation {
                ChangeOperation::Delete => {
                    records.remove(&change.record_id);
                }
                _ => {
                    let mut record = change.payload.clone();
                    record["id"] = json!(change.record_id);
                    records.insert(change.record_id.clone(), record);
                }
            }
        }
        drop(tables);

        self.version.fetch_add(1, Ordering::SeqCst);
        self.pushed_batches.lock().push(changes.to_vec());
        Ok(())
    }

    async fn fetch_delta(&self, table: &str, params: &DeltaQueryParams) -> ResilienceResult<DeltaResponse> {
        self.queries.lock().push(params.clone());
        let records: Vec<Value> = self
            .tables
            .lock()
            .get(table)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();

        let checksum = if self.corrupt_checksum.load(Ordering::SeqCst) {
            "bogus".to_string()
        } else {
            DeltaSyncManager::checksum_records(&records)
        };

        Ok(DeltaResponse {
            records,
            version: self.version.load(Ordering::SeqCst),
            checksum,
            server_time: chrono::Utc::now(),
        })
    }
}

/// Local copy of synced tables
#[derive(Default)]
pub struct InMemoryReplica {
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryReplica {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Value> {
        self.tables.lock().get(table).and_then(|t| t.get(id).cloned())
    }
}

#[async_trait]
impl LocalReplica for InMemoryReplica {
    async fn apply_delta(&self, table: &str, records: &[Value]) -> ResilienceResult<()> {
        let mut tables = self.tables.lock();
        let local = tables.entry(table.to_string()).or_default();
        for record in records {
            if let Some(id) = record.get("id").and_then(Value::as_str) {
                local.insert(id.to_string(), record.clone());
            }
        }
        Ok(())
    }

    async fn record_ids(&self, table: &str) -> ResilienceResult<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Memory store whose `delete_many` fails on demand, before touching anything
pub struct FlakyDeleteStore {
    inner: MemoryStore,
    fail_delete_many: AtomicBool,
}

impl FlakyDeleteStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            fail_delete_many: AtomicBool::new(false),
        })
    }

    pub fn fail_delete_many(&self, fail: bool) {
        self.fail_delete_many.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableStore for FlakyDeleteStore {
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
        if self.fail_delete_many.load(Ordering::SeqCst) {
            return Err(ResilienceError::Storage("disk I/O error".to_string()));
        }
        self.inner.delete_many(keys).await
    }

    async fn scan_prefix(&self, prefix: &str) -> ResilienceResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(prefix).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
