use super::types::{DeltaChange, DeltaQueryParams};
use crate::error::ResilienceResult;
use crate::network::RequestOptions;
use crate::queue::{Priority, RequestQueue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::form_urlencoded;

/// Records changed on the backend since a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaResponse {
    pub records: Vec<Value>,
    /// Backend version after this delta
    pub version: u64,
    /// Backend fingerprint of the table's full record-id set
    pub checksum: String,
    pub server_time: DateTime<Utc>,
}

/// Backend side of a sync round. Implementations must apply pushed changes
/// idempotently by change id: delivery is at-least-once.
#[async_trait::async_trait]
pub trait SyncBackend: Send + Sync {
    /// Send a batch. `Ok` means the backend acknowledged every change in it.
    async fn push_changes(&self, table: &str, changes: &[DeltaChange]) -> ResilienceResult<()>;

    async fn fetch_delta(&self, table: &str, params: &DeltaQueryParams) -> ResilienceResult<DeltaResponse>;
}

/// The application's local copy of synced tables
#[async_trait::async_trait]
pub trait LocalReplica: Send + Sync {
    async fn apply_delta(&self, table: &str, records: &[Value]) -> ResilienceResult<()>;

    /// Identities of every record currently held for `table`
    async fn record_ids(&self, table: &str) -> ResilienceResult<Vec<String>>;
}

/// Outcome of one sync round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub table: String,
    pub pushed: usize,
    pub pulled: usize,
    pub version: u64,
}

/// [`SyncBackend`] speaking HTTP through a [`RequestQueue`], so sync
/// traffic shares the concurrency budget, timeout and retry policy of every
/// other request.
///
/// - `POST {base}/{table}/changes` with `{"changes": [...]}`
/// - `GET {base}/{table}/delta?since=..&version=..&checksum=..`
pub struct HttpSyncBackend {
    queue: RequestQueue,
    base_path: String,
    priority: Priority,
}

impl HttpSyncBackend {
    pub fn new(queue: RequestQueue) -> Self {
        Self::with_base_path(queue, "/sync")
    }

    pub fn with_base_path(queue: RequestQueue, base_path: &str) -> Self {
        Self {
            queue,
            base_path: base_path.trim_end_matches('/').to_string(),
            priority: Priority::Normal,
        }
    }

    /// Queue priority for sync requests (`Normal` by default)
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    fn delta_target(&self, table: &str, params: &DeltaQueryParams) -> String {
        let pairs = params.to_query_pairs();
        let target = format!("{}/{}/delta", self.base_path, table);
        if pairs.is_empty() {
            return target;
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        format!("{}?{}", target, query)
    }

    /// The queue only resolves `Ok` for success statuses
    async fn call(&self, target: String, options: RequestOptions) -> ResilienceResult<Value> {
        let response = self.queue.enqueue(target, options, self.priority).await?;
        Ok(response.body)
    }
}

#[async_trait::async_trait]
impl SyncBackend for HttpSyncBackend {
    async fn push_changes(&self, table: &str, changes: &[DeltaChange]) -> ResilienceResult<()> {
        let target = format!("{}/{}/changes", self.base_path, table);
        self.call(target, RequestOptions::post(json!({ "changes": changes })))
            .await?;
        Ok(())
    }

    async fn fetch_delta(&self, table: &str, params: &DeltaQueryParams) -> ResilienceResult<DeltaResponse> {
        let body = self
            .call(self.delta_target(table, params), RequestOptions::get())
            .await?;
        Ok(serde_json::from_value(body)?)
    }
}
