use super::channel::{
    ChannelState, ChannelStatusCallback, ChannelTopic, ChannelTransport, EventHandler, LiveChannel,
    RealtimeEvent,
};
use crate::error::ResilienceResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// In-process [`ChannelTransport`]: events handed to [`publish`](Self::publish)
/// are delivered to every subscribed channel whose schema, table and event
/// match. Row filters are carried but not evaluated.
#[derive(Clone)]
pub struct LocalChannelHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    channels: Mutex<Vec<Weak<LocalChannel>>>,
    opened: AtomicUsize,
    /// State reported to channels when they subscribe
    join_state: Mutex<ChannelState>,
}

struct LocalChannel {
    topic: ChannelTopic,
    handlers: Mutex<Vec<(String, EventHandler)>>,
    status: Mutex<Option<ChannelStatusCallback>>,
    state: Mutex<ChannelState>,
}

impl LocalChannelHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(Vec::new()),
                opened: AtomicUsize::new(0),
                join_state: Mutex::new(ChannelState::Subscribed),
            }),
        }
    }

    /// State new channels report when they subscribe. Use
    /// `ChannelState::Joining` to hold them in a connecting state.
    pub fn set_join_state(&self, state: ChannelState) {
        *self.inner.join_state.lock() = state;
    }

    /// Move every live channel to `state`, as a server would on reconnect
    /// or outage
    pub fn set_all_states(&self, state: ChannelState) {
        for channel in self.live_channels() {
            channel.transition(state);
        }
    }

    /// Deliver `event` to matching channels. Returns how many received it.
    pub fn publish(&self, event: &RealtimeEvent) -> usize {
        let targets: Vec<Arc<LocalChannel>> = self
            .live_channels()
            .into_iter()
            .filter(|c| *c.state.lock() == ChannelState::Subscribed)
            .filter(|c| {
                c.topic.table == event.table
                    && c.topic.schema == event.schema
                    && c.topic.matches_event(&event.event_type)
            })
            .collect();

        for channel in &targets {
            channel.deliver(event);
        }
        targets.len()
    }

    /// Channels currently joining or subscribed
    pub fn open_channels(&self) -> usize {
        self.live_channels()
            .iter()
            .filter(|c| matches!(*c.state.lock(), ChannelState::Joining | ChannelState::Subscribed))
            .count()
    }

    /// Channels ever opened through this hub
    pub fn opened_total(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    fn live_channels(&self) -> Vec<Arc<LocalChannel>> {
        let mut channels = self.inner.channels.lock();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Default for LocalChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport for LocalChannelHub {
    fn open_channel(&self, topic: &ChannelTopic) -> ResilienceResult<Arc<dyn LiveChannel>> {
        let channel = Arc::new(LocalChannel {
            topic: topic.clone(),
            handlers: Mutex::new(Vec::new()),
            status: Mutex::new(None),
            state: Mutex::new(ChannelState::Closed),
        });
        self.inner.channels.lock().push(Arc::downgrade(&channel));
        self.inner.opened.fetch_add(1, Ordering::SeqCst);

        let join_state = *self.inner.join_state.lock();
        Ok(Arc::new(LocalChannelHandle {
            channel,
            join_state,
        }))
    }
}

impl LocalChannel {
    fn transition(&self, state: ChannelState) {
        *self.state.lock() = state;
        let callback = self.status.lock().clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    fn deliver(&self, event: &RealtimeEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(filter, _)| filter == "*" || filter.eq_ignore_ascii_case(&event.event_type))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

/// Owner side of a local channel; the hub only keeps weak references
struct LocalChannelHandle {
    channel: Arc<LocalChannel>,
    join_state: ChannelState,
}

impl LiveChannel for LocalChannelHandle {
    fn on(&self, event: &str, handler: EventHandler) {
        self.channel.handlers.lock().push((event.to_string(), handler));
    }

    fn subscribe(&self, status: ChannelStatusCallback) {
        *self.channel.status.lock() = Some(status);
        self.channel.transition(ChannelState::Joining);
        if self.join_state != ChannelState::Joining {
            self.channel.transition(self.join_state);
        }
    }

    fn unsubscribe(&self) {
        if *self.channel.state.lock() == ChannelState::Closed {
            return;
        }
        self.channel.transition(ChannelState::Closed);
        self.channel.handlers.lock().clear();
        *self.channel.status.lock() = None;
    }
}
