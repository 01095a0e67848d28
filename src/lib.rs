pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod queue;
pub mod realtime;
pub mod storage;
pub mod sync;

pub use cache::{CacheConfig, CacheStats, OfflineCache};
pub use client::{ClientBuilder, ResilientClient, WriteOutcome};
pub use config::Config;
pub use error::{ResilienceError, ResilienceResult};
pub use logging::init_logging;
pub use network::{EffectiveType, HttpTransport, NetworkMonitor, NetworkStatus, RequestOptions, Transport, TransportResponse};
pub use queue::{PendingRequest, Priority, QueueStats, RequestQueue, RequestQueueConfig};
pub use realtime::{ConnectionStatus, RealtimeManager, SubscriptionConfig, SubscriptionHandle};
pub use storage::{DurableStore, MemoryStore, RocksStore, SqliteStore};
pub use sync::{ChangeOperation, DeltaChange, DeltaSyncManager, SyncBackend, SyncConfig, SyncState};
