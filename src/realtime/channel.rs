use crate::error::{ResilienceError, ResilienceResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What a live channel listens to. Unset parts take the defaults
/// (`public` schema, every event, no filter).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelTopic {
    pub schema: String,
    pub table: String,
    pub event: String,
    pub filter: String,
}

impl ChannelTopic {
    /// Canonical `schema:table:event:filter` key. Equal topics share a key.
    pub fn key(&self) -> String {
        format!("{}:{}:{}:{}", self.schema, self.table, self.event, self.filter)
    }

    /// Whether an event of type `event_type` belongs to this topic
    pub fn matches_event(&self, event_type: &str) -> bool {
        self.event == "*" || self.event.eq_ignore_ascii_case(event_type)
    }
}

impl fmt::Display for ChannelTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A row change pushed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// `INSERT`, `UPDATE` or `DELETE`
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
}

impl RealtimeEvent {
    pub fn new(event_type: &str, schema: &str, table: &str, record: Option<Value>) -> Self {
        Self {
            event_type: event_type.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            record,
            old_record: None,
        }
    }
}

/// Lifecycle of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Joining,
    Subscribed,
    Closed,
    Errored,
}

pub type EventHandler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;
pub type ChannelStatusCallback = Arc<dyn Fn(ChannelState) + Send + Sync>;

/// One open live-update channel.
///
/// Handlers may be invoked from any thread, including synchronously from
/// inside `subscribe` or `unsubscribe`.
pub trait LiveChannel: Send + Sync {
    /// Register `handler` for events of type `event` (`*` for all)
    fn on(&self, event: &str, handler: EventHandler);

    /// Start listening. `status` receives every state change.
    fn subscribe(&self, status: ChannelStatusCallback);

    /// Stop listening and release the underlying connection. Idempotent.
    fn unsubscribe(&self);
}

/// Opens live channels. Each call yields a fresh channel; deduplication is
/// the caller's job.
pub trait ChannelTransport: Send + Sync {
    fn open_channel(&self, topic: &ChannelTopic) -> ResilienceResult<Arc<dyn LiveChannel>>;
}

pub(crate) fn validate_topic(topic: &ChannelTopic) -> ResilienceResult<()> {
    if topic.table.is_empty() {
        return Err(ResilienceError::InvalidInput(
            "Subscription table must not be empty".to_string(),
        ));
    }
    // The filter is the last key segment and may contain ':'
    for (name, part) in [("schema", &topic.schema), ("table", &topic.table), ("event", &topic.event)] {
        if part.contains(':') {
            return Err(ResilienceError::InvalidInput(format!(
                "Subscription {} must not contain ':': {}",
                name, part
            )));
        }
    }
    Ok(())
}
