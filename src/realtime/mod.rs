//! Realtime subscriptions
//!
//! Multiplexes application listeners onto live channels: all listeners of
//! one topic share a single channel, which is opened by the first listener
//! and torn down when the last one leaves. Channel states are aggregated
//! into one [`ConnectionStatus`].

mod channel;
mod local;
mod websocket;

pub use channel::{
    ChannelState, ChannelStatusCallback, ChannelTopic, ChannelTransport, EventHandler,
    LiveChannel, RealtimeEvent,
};
pub use local::LocalChannelHub;
pub use websocket::WebSocketChannelTransport;

use crate::error::ResilienceResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_SCHEMA: &str = "public";

/// Aggregate connection status across all channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    #[default]
    Disconnected,
}

/// What to listen to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// `INSERT`, `UPDATE`, `DELETE` or `*`
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
}

impl SubscriptionConfig {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    pub fn with_event(mut self, event: &str) -> Self {
        self.event = Some(event.to_string());
        self
    }

    pub fn with_filter(mut self, filter: &str) -> Self {
        self.filter = Some(filter.to_string());
        self
    }

    fn topic(&self, default_schema: &str) -> ChannelTopic {
        ChannelTopic {
            schema: self
                .schema
                .clone()
                .unwrap_or_else(|| default_schema.to_string()),
            table: self.table.clone(),
            event: self.event.clone().unwrap_or_else(|| "*".to_string()),
            filter: self.filter.clone().unwrap_or_default(),
        }
    }
}

pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

struct TopicEntry {
    channel: Arc<dyn LiveChannel>,
    listeners: BTreeMap<u64, EventHandler>,
    state: ChannelState,
}

struct RealtimeInner {
    transport: Arc<dyn ChannelTransport>,
    default_schema: String,
    topics: Mutex<HashMap<String, TopicEntry>>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_listeners: Mutex<BTreeMap<u64, StatusListener>>,
    next_id: AtomicU64,
}

/// Subscription registry over a [`ChannelTransport`].
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<RealtimeInner>,
}

impl RealtimeManager {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self::with_default_schema(transport, DEFAULT_SCHEMA)
    }

    pub fn with_default_schema(transport: Arc<dyn ChannelTransport>, schema: &str) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(RealtimeInner {
                transport,
                default_schema: schema.to_string(),
                topics: Mutex::new(HashMap::new()),
                status_tx,
                status_listeners: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for changes matching `config`. Opens a channel
    /// only if no listener is registered for the same topic yet.
    pub fn subscribe<F>(&self, config: SubscriptionConfig, callback: F) -> ResilienceResult<SubscriptionHandle>
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let topic = config.topic(&self.inner.default_schema);
        channel::validate_topic(&topic)?;
        let key = topic.key();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: EventHandler = Arc::new(callback);

        if self.inner.add_listener(&key, id, &callback) {
            debug!("Joined existing channel {}", key);
            return Ok(self.handle(key, id));
        }

        let channel = self.inner.transport.open_channel(&topic)?;
        let weak = Arc::downgrade(&self.inner);
        let fan_out_key = key.clone();
        channel.on(
            &topic.event,
            Arc::new(move |event: &RealtimeEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.fan_out(&fan_out_key, event);
                }
            }),
        );

        {
            let mut topics = self.inner.topics.lock();
            if let Some(entry) = topics.get_mut(&key) {
                // Lost a race with a concurrent subscribe for the same topic
                entry.listeners.insert(id, callback);
                drop(topics);
                channel.unsubscribe();
                return Ok(self.handle(key, id));
            }
            let mut listeners = BTreeMap::new();
            listeners.insert(id, callback);
            topics.insert(
                key.clone(),
                TopicEntry {
                    channel: channel.clone(),
                    listeners,
                    state: ChannelState::Joining,
                },
            );
        }
        info!("Opened channel {}", key);
        self.inner.refresh_status();

        let weak = Arc::downgrade(&self.inner);
        let status_key = key.clone();
        channel.subscribe(Arc::new(move |state: ChannelState| {
            if let Some(inner) = weak.upgrade() {
                inner.channel_state_changed(&status_key, state);
            }
        }));

        Ok(self.handle(key, id))
    }

    /// Tear down every channel and drop every listener
    pub fn unsubscribe_all(&self) {
        let drained: Vec<(String, TopicEntry)> = self.inner.topics.lock().drain().collect();
        for (key, entry) in &drained {
            debug!("Closing channel {}", key);
            entry.channel.unsubscribe();
        }
        if !drained.is_empty() {
            info!("Closed {} channels", drained.len());
        }
        self.inner.publish_status(ConnectionStatus::Disconnected);
    }

    /// Keys of every open channel, sorted
    pub fn get_active_subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.topics.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(key)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Call `listener` on every status transition. Returns an id for
    /// [`remove_status_listener`](Self::remove_status_listener).
    pub fn on_status_change<F>(&self, listener: F) -> u64
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.status_listeners.lock().insert(id, Arc::new(listener));
        id
    }

    pub fn remove_status_listener(&self, id: u64) -> bool {
        self.inner.status_listeners.lock().remove(&id).is_some()
    }

    fn handle(&self, key: String, id: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            inner: Some(Arc::downgrade(&self.inner)),
            key,
            id,
        }
    }
}

impl RealtimeInner {
    /// Add to an existing topic. Returns false when the topic has no channel.
    fn add_listener(&self, key: &str, id: u64, callback: &EventHandler) -> bool {
        match self.topics.lock().get_mut(key) {
            Some(entry) => {
                entry.listeners.insert(id, callback.clone());
                true
            }
            None => false,
        }
    }

    fn remove_listener(&self, key: &str, id: u64) {
        let closed = {
            let mut topics = self.topics.lock();
            let Some(entry) = topics.get_mut(key) else {
                return;
            };
            entry.listeners.remove(&id);
            if entry.listeners.is_empty() {
                topics.remove(key).map(|entry| entry.channel)
            } else {
                None
            }
        };

        if let Some(channel) = closed {
            info!("Last listener left, closing channel {}", key);
            channel.unsubscribe();
            self.refresh_status();
        }
    }

    fn fan_out(&self, key: &str, event: &RealtimeEvent) {
        // Snapshot so callbacks can subscribe/unsubscribe without deadlocking
        let listeners: Vec<EventHandler> = match self.topics.lock().get(key) {
            Some(entry) => entry.listeners.values().cloned().collect(),
            None => return,
        };
        for listener in listeners {
            listener(event);
        }
    }

    fn channel_state_changed(&self, key: &str, state: ChannelState) {
        {
            let mut topics = self.topics.lock();
            let Some(entry) = topics.get_mut(key) else {
                return;
            };
            entry.state = state;
        }
        if state == ChannelState::Errored {
            warn!("Channel {} errored", key);
        } else {
            debug!("Channel {} is {:?}", key, state);
        }
        self.refresh_status();
    }

    fn refresh_status(&self) {
        let status = {
            let topics = self.topics.lock();
            aggregate_status(topics.values().map(|entry| entry.state))
        };
        self.publish_status(status);
    }

    fn publish_status(&self, status: ConnectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if !changed {
            return;
        }
        debug!("Realtime status -> {:?}", status);
        let listeners: Vec<StatusListener> = self.status_listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }
}

/// No channels is disconnected; every channel subscribed is connected;
/// otherwise any channel still joining makes the whole connecting.
fn aggregate_status(states: impl Iterator<Item = ChannelState>) -> ConnectionStatus {
    let mut any = false;
    let mut all_subscribed = true;
    let mut any_joining = false;
    for state in states {
        any = true;
        all_subscribed &= state == ChannelState::Subscribed;
        any_joining |= state == ChannelState::Joining;
    }
    match (any, all_subscribed, any_joining) {
        (false, _, _) => ConnectionStatus::Disconnected,
        (true, true, _) => ConnectionStatus::Connected,
        (true, false, true) => ConnectionStatus::Connecting,
        (true, false, false) => ConnectionStatus::Disconnected,
    }
}

/// Keeps one listener registered. Dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    inner: Option<Weak<RealtimeInner>>,
    key: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(inner) = self.inner.take().and_then(|weak| weak.upgrade()) {
            inner.remove_listener(&self.key, self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
