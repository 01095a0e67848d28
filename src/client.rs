//! Resilient Client
//!
//! Wires the request queue, delta sync, realtime subscriptions and offline
//! cache together from one [`Config`], and offers the two flows most apps
//! need: read with cache fallback, and write-or-queue.

use crate::cache::OfflineCache;
use crate::config::{Config, StorageBackend};
use crate::error::{ResilienceError, ResilienceResult};
use crate::logging::init_logging;
use crate::network::{HttpTransport, Method, NetworkMonitor, NetworkStatus, RequestOptions, Transport, TransportResponse};
use crate::queue::{Priority, RequestQueue};
use crate::realtime::{
    ChannelTransport, RealtimeEvent, RealtimeManager, SubscriptionConfig, SubscriptionHandle,
    WebSocketChannelTransport,
};
use crate::storage::{DurableStore, MemoryStore, RocksStore, SqliteStore};
use crate::sync::{
    ChangeOperation, DeltaChange, DeltaSyncManager, HttpSyncBackend, LocalReplica, SyncBackend, SyncReport,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const APP_NAME: &str = "steadylink";

/// Result of [`ResilientClient::write_or_queue`]
#[derive(Debug)]
pub enum WriteOutcome {
    /// The backend accepted the write
    Sent(TransportResponse),
    /// The write is stored locally and goes out with the next sync round
    Queued(DeltaChange),
}

/// Builder for [`ResilientClient`]. Anything not supplied is created from
/// the config.
pub struct ClientBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn DurableStore>>,
    channels: Option<Arc<dyn ChannelTransport>>,
    monitor: Option<Arc<NetworkMonitor>>,
}

impl ClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn channel_transport(mut self, channels: Arc<dyn ChannelTransport>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Open storage, restore sync state and start background work
    pub async fn init(self) -> ResilienceResult<ResilientClient> {
        self.config.validate()?;
        let config = self.config;
        if init_logging(&config.logging.filter) {
            info!("Logging initialized with filter {}", config.logging.filter);
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let base_url = config.api.base_url.as_deref().ok_or_else(|| {
                    ResilienceError::Config("api.base_url is required without a custom transport".to_string())
                })?;
                let mut http = HttpTransport::new(base_url)?;
                if let Some(token) = &config.api.token {
                    http.set_token(token);
                }
                Arc::new(http)
            }
        };

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config)?,
        };

        let channels = match (self.channels, &config.realtime.url) {
            (Some(channels), _) => Some(channels),
            (None, Some(url)) => {
                let mut ws = WebSocketChannelTransport::new(url)?;
                if let Some(token) = &config.api.token {
                    ws = ws.with_token(token);
                }
                Some(Arc::new(ws) as Arc<dyn ChannelTransport>)
            }
            (None, None) => None,
        };

        let monitor = self.monitor.unwrap_or_else(|| {
            Arc::new(NetworkMonitor::new(NetworkStatus {
                effective_type: config.queue.initial_effective_type,
                online: true,
            }))
        });

        let queue = RequestQueue::new(transport, config.queue.clone());
        queue.attach_network_monitor(&monitor);

        let sync = DeltaSyncManager::open(store.clone(), config.sync.clone()).await?;
        let cache = Arc::new(OfflineCache::new(store.clone(), config.cache.clone()));
        let sweeper = cache.spawn_sweeper();
        let realtime = channels
            .map(|channels| RealtimeManager::with_default_schema(channels, &config.realtime.default_schema));

        info!(
            "Client ready: {} store, realtime {}",
            store.name(),
            if realtime.is_some() { "enabled" } else { "disabled" }
        );

        Ok(ResilientClient {
            config,
            store,
            monitor,
            queue,
            sync,
            cache,
            realtime,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }
}

pub struct ResilientClient {
    config: Config,
    store: Arc<dyn DurableStore>,
    monitor: Arc<NetworkMonitor>,
    queue: RequestQueue,
    sync: DeltaSyncManager,
    cache: Arc<OfflineCache>,
    realtime: Option<RealtimeManager>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder {
            config,
            transport: None,
            store: None,
            channels: None,
            monitor: None,
        }
    }

    /// Build everything from the config alone
    pub async fn init(config: Config) -> ResilienceResult<Self> {
        Self::builder(config).init().await
    }

    /// GET `target` through the queue and cache the body under `cache_key`.
    /// When offline or when the request fails, the cached copy is returned
    /// instead, if there is one.
    pub async fn fetch_with_fallback(
        &self,
        target: &str,
        cache_key: &str,
        priority: Priority,
        ttl: Option<Duration>,
    ) -> ResilienceResult<Value> {
        if !self.monitor.is_online() {
            return self.cache.get::<Value>(cache_key).await.ok_or_else(|| {
                ResilienceError::Transport(format!("Offline and nothing cached for {}", cache_key))
            });
        }

        match self.queue.enqueue(target, RequestOptions::get(), priority).await {
            Ok(response) => {
                self.cache.set(cache_key, &response.body, ttl).await;
                Ok(response.body)
            }
            Err(e) => match self.cache.get::<Value>(cache_key).await {
                Some(cached) => {
                    warn!("Fetch of {} failed ({}), serving cached {}", target, e, cache_key);
                    Ok(cached)
                }
                None => Err(e),
            },
        }
    }

    /// Send a mutation right away when online; otherwise, or when the send
    /// fails with a transient error, queue it as a pending change.
    pub async fn write_or_queue(
        &self,
        target: &str,
        table: &str,
        operation: ChangeOperation,
        payload: Value,
        record_id: &str,
    ) -> ResilienceResult<WriteOutcome> {
        if self.monitor.is_online() {
            let method = match operation {
                ChangeOperation::Insert => Method::Post,
                ChangeOperation::Update => Method::Patch,
                ChangeOperation::Delete => Method::Delete,
            };
            let options = RequestOptions::default()
                .with_method(method)
                .with_body(payload.clone());

            match self.queue.enqueue(target, options, Priority::High).await {
                Ok(response) => return Ok(WriteOutcome::Sent(response)),
                Err(e) if e.is_retryable() => {
                    warn!("Write to {} failed ({}), queueing for sync", target, e);
                }
                Err(e) => return Err(e),
            }
        }

        let change = self
            .sync
            .queue_change(table, operation, payload, record_id)
            .await?;
        Ok(WriteOutcome::Queued(change))
    }

    /// One sync round per table, in order. Every table is attempted; the
    /// outcome of each is returned.
    pub async fn sync_tables(
        &self,
        tables: &[&str],
        backend: &dyn SyncBackend,
        replica: &dyn LocalReplica,
    ) -> Vec<(String, ResilienceResult<SyncReport>)> {
        let mut outcomes = Vec::with_capacity(tables.len());
        for table in tables {
            let outcome = self.sync.sync_table(table, backend, replica).await;
            if let Err(e) = &outcome {
                warn!("Sync of {} failed: {}", table, e);
            }
            outcomes.push((table.to_string(), outcome));
        }
        outcomes
    }

    /// HTTP sync backend sending through this client's request queue
    pub fn sync_backend(&self) -> HttpSyncBackend {
        HttpSyncBackend::new(self.queue.clone())
    }

    pub fn subscribe<F>(&self, config: SubscriptionConfig, callback: F) -> ResilienceResult<SubscriptionHandle>
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        match &self.realtime {
            Some(realtime) => realtime.subscribe(config, callback),
            None => Err(ResilienceError::Config(
                "Realtime is not configured (realtime.url)".to_string(),
            )),
        }
    }

    /// Stop background work, cancel queued requests and close channels.
    /// Idempotent.
    pub fn dispose(&self) {
        self.queue.dispose();
        if let Some(realtime) = &self.realtime {
            realtime.unsubscribe_all();
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
            info!("Client disposed");
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn sync(&self) -> &DeltaSyncManager {
        &self.sync
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.cache
    }

    pub fn realtime(&self) -> Option<&RealtimeManager> {
        self.realtime.as_ref()
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn open_store(config: &Config) -> ResilienceResult<Arc<dyn DurableStore>> {
    let path = config.storage.path.clone();
    Ok(match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => match path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(SqliteStore::open_default(APP_NAME)?),
        },
        StorageBackend::Rocksdb => {
            let path = match path {
                Some(path) => path,
                None => dirs::data_dir()
                    .ok_or_else(|| ResilienceError::Config("No data directory on this platform".to_string()))?
                    .join(APP_NAME)
                    .join("rocks"),
            };
            Arc::new(RocksStore::open(path)?)
        }
    })
}
