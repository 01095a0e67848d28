use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

/// A local mutation waiting for backend acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaChange {
    /// `table:record_id:version`, unique per change
    pub id: String,
    pub table: String,
    pub record_id: String,
    pub operation: ChangeOperation,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Monotonic, derived from the creation time in milliseconds
    pub version: u64,
}

impl DeltaChange {
    /// Approximate serialized size of the payload
    pub fn payload_bytes(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0)
    }
}

/// Per-table checkpoint of the last successful sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub table: String,
    pub last_sync_at: DateTime<Utc>,
    pub last_version: u64,
    pub checksum: String,
}

/// Parameters asking the backend for records changed since the checkpoint.
/// All fields are absent before a table's first sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaQueryParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl DeltaQueryParams {
    pub fn is_full_sync(&self) -> bool {
        self.since.is_none() && self.version.is_none()
    }

    /// Query-string pairs, for transports that pass them in the URL
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(since) = self.since {
            pairs.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }
        if let Some(version) = self.version {
            pairs.push(("version", version.to_string()));
        }
        if let Some(checksum) = &self.checksum {
            pairs.push(("checksum", checksum.clone()));
        }
        pairs
    }
}

/// Pending queue statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingStats {
    pub count: usize,
    /// Total serialized size of pending payloads
    pub bytes: usize,
}
