//! Configuration handling
//!
//! Settings come from a TOML file, then environment overrides.
//!
//! ## Environment Variables
//!
//! Loaded after any `.env` file in the working directory:
//!
//! - `STEADYLINK_BASE_URL` - Backend base URL for the HTTP transport
//! - `STEADYLINK_TOKEN` - Bearer token sent with every request
//! - `STEADYLINK_REALTIME_URL` - WebSocket changefeed URL
//! - `STEADYLINK_RETRY_LIMIT` - Retries after the first attempt
//! - `STEADYLINK_RETRY_DELAY_MS` - Base of the linear backoff
//! - `STEADYLINK_REQUEST_TIMEOUT_MS` - Per-attempt timeout
//! - `STEADYLINK_EFFECTIVE_TYPE` - Initial connection class (`slow-2g` .. `4g`)
//! - `STEADYLINK_CACHE_NAMESPACE` - Offline cache key namespace
//! - `STEADYLINK_CACHE_TTL_SECS` - Default cache TTL
//! - `STEADYLINK_SYNC_BATCH_SIZE` - Changes per pushed batch
//! - `STEADYLINK_STORAGE` - `memory`, `rocksdb` or `sqlite`
//! - `STEADYLINK_STORAGE_PATH` - Database path for on-disk stores
//! - `STEADYLINK_LOG` - Log filter, e.g. `steadylink=debug`

use crate::cache::CacheConfig;
use crate::error::{ResilienceError, ResilienceResult};
use crate::network::EffectiveType;
use crate::queue::RequestQueueConfig;
use crate::sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "steadylink.toml";

pub const ENV_BASE_URL: &str = "STEADYLINK_BASE_URL";
pub const ENV_TOKEN: &str = "STEADYLINK_TOKEN";
pub const ENV_REALTIME_URL: &str = "STEADYLINK_REALTIME_URL";
pub const ENV_RETRY_LIMIT: &str = "STEADYLINK_RETRY_LIMIT";
pub const ENV_RETRY_DELAY_MS: &str = "STEADYLINK_RETRY_DELAY_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "STEADYLINK_REQUEST_TIMEOUT_MS";
pub const ENV_EFFECTIVE_TYPE: &str = "STEADYLINK_EFFECTIVE_TYPE";
pub const ENV_CACHE_NAMESPACE: &str = "STEADYLINK_CACHE_NAMESPACE";
pub const ENV_CACHE_TTL_SECS: &str = "STEADYLINK_CACHE_TTL_SECS";
pub const ENV_SYNC_BATCH_SIZE: &str = "STEADYLINK_SYNC_BATCH_SIZE";
pub const ENV_STORAGE: &str = "STEADYLINK_STORAGE";
pub const ENV_STORAGE_PATH: &str = "STEADYLINK_STORAGE_PATH";
pub const ENV_LOG: &str = "STEADYLINK_LOG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub queue: RequestQueueConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub realtime: RealtimeConfig,
    pub logging: LoggingConfig,
}

/// Backend endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Rocksdb,
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "rocksdb" | "rocks" => Ok(StorageBackend::Rocksdb),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(ResilienceError::Config(format!(
                "Unknown storage backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database location; the platform data directory when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// WebSocket changefeed; realtime is unavailable when unset
    pub url: Option<String>,
    pub default_schema: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_schema: crate::realtime::DEFAULT_SCHEMA.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "steadylink=info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> ResilienceResult<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ResilienceError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ResilienceResult<Self> {
        if !path.exists() {
            return Err(ResilienceError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by `STEADYLINK_*` variables, after loading `.env`
    pub fn from_env() -> ResilienceResult<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Config::default();
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// File settings (when the file exists) with environment overrides on top
    pub fn load(path: &Path) -> ResilienceResult<Self> {
        if let Some(dir) = path.parent() {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
            }
        }

        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Config::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> ResilienceResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(url) = var(ENV_BASE_URL) {
            self.api.base_url = Some(url);
        }
        if let Some(token) = var(ENV_TOKEN) {
            self.api.token = Some(token);
        }
        if let Some(url) = var(ENV_REALTIME_URL) {
            self.realtime.url = Some(url);
        }
        if let Some(v) = var(ENV_RETRY_LIMIT) {
            self.queue.retry_limit = parse_var(ENV_RETRY_LIMIT, &v)?;
        }
        if let Some(v) = var(ENV_RETRY_DELAY_MS) {
            self.queue.retry_delay_ms = parse_var(ENV_RETRY_DELAY_MS, &v)?;
        }
        if let Some(v) = var(ENV_REQUEST_TIMEOUT_MS) {
            self.queue.request_timeout_ms = parse_var(ENV_REQUEST_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = var(ENV_EFFECTIVE_TYPE) {
            self.queue.initial_effective_type = v.parse::<EffectiveType>().unwrap_or_default();
        }
        if let Some(v) = var(ENV_CACHE_NAMESPACE) {
            self.cache.namespace = v;
        }
        if let Some(v) = var(ENV_CACHE_TTL_SECS) {
            self.cache.default_ttl_secs = parse_var(ENV_CACHE_TTL_SECS, &v)?;
        }
        if let Some(v) = var(ENV_SYNC_BATCH_SIZE) {
            self.sync.batch_size = parse_var(ENV_SYNC_BATCH_SIZE, &v)?;
        }
        if let Some(v) = var(ENV_STORAGE) {
            self.storage.backend = v.parse()?;
        }
        if let Some(v) = var(ENV_STORAGE_PATH) {
            self.storage.path = Some(PathBuf::from(v));
        }
        if let Some(v) = var(ENV_LOG) {
            self.logging.filter = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.queue.request_timeout_ms == 0 {
            return Err(ResilienceError::Config(
                "queue.request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(ResilienceError::Config(
                "cache.default_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(ResilienceError::Config(
                "cache.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.cache.namespace.is_empty() {
            return Err(ResilienceError::Config(
                "cache.namespace must not be empty".to_string(),
            ));
        }
        // Keys are `cache_<namespace>_<key>`, so `a` would also own `a_b`
        if self.cache.namespace.contains('_') {
            return Err(ResilienceError::Config(format!(
                "cache.namespace must not contain '_': {}",
                self.cache.namespace
            )));
        }
        if self.sync.batch_size == 0 {
            return Err(ResilienceError::Config(
                "sync.batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> ResilienceResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ResilienceError::Config(format!("{}='{}': {}", name, value, e)))
}
