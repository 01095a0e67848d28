use super::channel::{
    ChannelState, ChannelStatusCallback, ChannelTopic, ChannelTransport, EventHandler, LiveChannel,
    RealtimeEvent,
};
use crate::error::{ResilienceError, ResilienceResult};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

/// [`ChannelTransport`] over a WebSocket changefeed.
///
/// Every channel is its own connection. After connecting it sends
/// `{"type":"subscribe","schema":..,"table":..,"event":..,"filter":..}`; the
/// server answers `{"type":"subscribed"}` and then streams change events.
/// `{"type":"error"}` frames mark the channel as errored.
pub struct WebSocketChannelTransport {
    url: Url,
}

impl WebSocketChannelTransport {
    pub fn new(url: &str) -> ResilienceResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| ResilienceError::InvalidInput(format!("Bad changefeed URL: {}", e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(ResilienceError::InvalidInput(format!(
                "Changefeed URL must be ws:// or wss://, got {}://",
                other
            ))),
        }
    }

    /// Authenticate with a `token` query parameter
    pub fn with_token(mut self, token: &str) -> Self {
        self.url.query_pairs_mut().append_pair("token", token);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl ChannelTransport for WebSocketChannelTransport {
    fn open_channel(&self, topic: &ChannelTopic) -> ResilienceResult<Arc<dyn LiveChannel>> {
        Ok(Arc::new(WebSocketChannel {
            url: self.url.clone(),
            topic: topic.clone(),
            handlers: Arc::new(Mutex::new(Vec::new())),
            shutdown: Mutex::new(None),
        }))
    }
}

type Handlers = Arc<Mutex<Vec<(String, EventHandler)>>>;

struct WebSocketChannel {
    url: Url,
    topic: ChannelTopic,
    handlers: Handlers,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl LiveChannel for WebSocketChannel {
    fn on(&self, event: &str, handler: EventHandler) {
        self.handlers.lock().push((event.to_string(), handler));
    }

    fn subscribe(&self, status: ChannelStatusCallback) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("[REALTIME-WS] No runtime to run channel {}: {}", self.topic, e);
                status(ChannelState::Errored);
                return;
            }
        };

        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.shutdown.lock().replace(tx) {
            let _ = previous.send(());
        }

        status(ChannelState::Joining);
        runtime.spawn(run_channel(
            self.url.clone(),
            self.topic.clone(),
            self.handlers.clone(),
            status,
            rx,
        ));
    }

    fn unsubscribe(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        self.handlers.lock().clear();
    }
}

async fn run_channel(
    url: Url,
    topic: ChannelTopic,
    handlers: Handlers,
    status: ChannelStatusCallback,
    mut shutdown: oneshot::Receiver<()>,
) {
    tracing::debug!("[REALTIME-WS] Connecting {} to {}", topic, url);

    let ws_stream = tokio::select! {
        connected = connect_async(url.as_str()) => match connected {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::warn!("[REALTIME-WS] Connect failed for {}: {}", topic, e);
                status(ChannelState::Errored);
                return;
            }
        },
        _ = &mut shutdown => {
            status(ChannelState::Closed);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let subscribe_msg = json!({
        "type": "subscribe",
        "schema": topic.schema,
        "table": topic.table,
        "event": topic.event,
        "filter": topic.filter,
    });
    if let Err(e) = write.send(Message::Text(subscribe_msg.to_string().into())).await {
        tracing::warn!("[REALTIME-WS] Subscribe failed for {}: {}", topic, e);
        status(ChannelState::Errored);
        return;
    }

    let final_state = loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(&topic, &handlers, &status, &text),
                Some(Ok(Message::Close(_))) | None => break ChannelState::Closed,
                Some(Err(e)) => {
                    tracing::warn!("[REALTIME-WS] Channel {} failed: {}", topic, e);
                    break ChannelState::Errored;
                }
                Some(Ok(_)) => {}
            },
            _ = &mut shutdown => {
                let unsubscribe_msg = json!({"type": "unsubscribe", "table": topic.table});
                let _ = write.send(Message::Text(unsubscribe_msg.to_string().into())).await;
                let _ = write.send(Message::Close(None)).await;
                break ChannelState::Closed;
            }
        }
    };

    tracing::debug!("[REALTIME-WS] Channel {} ended: {:?}", topic, final_state);
    status(final_state);
}

fn handle_frame(topic: &ChannelTopic, handlers: &Handlers, status: &ChannelStatusCallback, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            tracing::trace!("[REALTIME-WS] Ignoring non-JSON frame on {}", topic);
            return;
        }
    };

    match frame.get("type").and_then(Value::as_str) {
        Some("subscribed") => status(ChannelState::Subscribed),
        Some("error") => {
            tracing::warn!("[REALTIME-WS] Server error on {}: {}", topic, frame);
            status(ChannelState::Errored);
        }
        _ => match serde_json::from_value::<RealtimeEvent>(frame) {
            Ok(event) => {
                let matching: Vec<EventHandler> = handlers
                    .lock()
                    .iter()
                    .filter(|(filter, _)| filter == "*" || filter.eq_ignore_ascii_case(&event.event_type))
                    .map(|(_, handler)| handler.clone())
                    .collect();
                for handler in matching {
                    handler(&event);
                }
            }
            Err(_) => tracing::trace!("[REALTIME-WS] Received non-event message: {}", text),
        },
    }
}
