//! Configuration for dagrun masters, workers and the coordinator
//!
//! Every struct has a `Default`, `with_*` builders, and loads from a JSON file
//! where missing fields fall back to their defaults.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Interval settings feed `tokio::time::interval`, which rejects zero
fn require_positive(name: &str, value_ms: u64) -> Result<(), ConfigError> {
    if value_ms == 0 {
        return Err(ConfigError::Invalid(format!("{} must be positive", name)));
    }
    Ok(())
}

impl RegistryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("registry.keepalive_interval_ms", self.keepalive_interval_ms)?;
        require_positive("registry.watch_poll_interval_ms", self.watch_poll_interval_ms)
    }
}

/// Prefix `http://` unless the address already names a scheme
fn http_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// How the dispatcher picks among candidate workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    RoundRobin,
    LowestLoad,
}

/// Connection to the coordination service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the coordinator (e.g., "http://127.0.0.1:5600")
    pub address: String,

    /// Interval between session keepalives
    pub keepalive_interval_ms: u64,

    /// Interval between children polls backing `watch_children`
    pub watch_poll_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:5600".to_string(),
            keepalive_interval_ms: 1000,
            watch_poll_interval_ms: 500,
        }
    }
}

impl RegistryConfig {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = http_url(&address.into());
        self
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms)
    }
}

/// Remote dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Send attempts (with host re-selection) before a dispatch is declared failed
    pub max_attempts: u32,

    pub selector: SelectorKind,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            selector: SelectorKind::RoundRobin,
        }
    }
}

impl DispatchConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_selector(mut self, selector: SelectorKind) -> Self {
        self.selector = selector;
        self
    }
}

/// Retry-until-ack event delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Interval between resends of unacknowledged events
    pub retry_interval_ms: u64,

    /// Give up after this many attempts. None retries forever
    pub max_attempts: Option<u32>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
            max_attempts: None,
        }
    }
}

impl DeliveryConfig {
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Master takeover settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Interval of the periodic scan for unfinished workflows without an owner
    pub orphan_scan_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            orphan_scan_interval_ms: 5000,
        }
    }
}

impl FailoverConfig {
    pub fn orphan_scan_interval(&self) -> Duration {
        Duration::from_millis(self.orphan_scan_interval_ms)
    }
}

/// Worker execution pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_concurrent: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_concurrent: 8 }
    }
}

/// Configuration for a master process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Unique host name of this master
    pub host: String,

    /// Address to listen on for HTTP frames (e.g., "0.0.0.0:5700")
    pub listen_address: String,

    /// Advertised address for workers to connect to
    /// If None, uses the listen_address
    pub advertise_address: Option<String>,

    pub registry: RegistryConfig,
    pub dispatch: DispatchConfig,
    /// Kill delivery towards workers
    pub delivery: DeliveryConfig,
    pub failover: FailoverConfig,

    /// Directory of the JSON metadata store. None keeps metadata in memory
    pub store_dir: Option<PathBuf>,

    /// Directory of workflow definition files (`*.json`) registered at startup
    pub definitions_dir: Option<PathBuf>,

    /// Timeout of one outbound HTTP request
    pub request_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "master-1".to_string(),
            listen_address: "127.0.0.1:5700".to_string(),
            advertise_address: None,
            registry: RegistryConfig::default(),
            dispatch: DispatchConfig::default(),
            delivery: DeliveryConfig::default(),
            failover: FailoverConfig::default(),
            store_dir: None,
            definitions_dir: None,
            request_timeout_ms: 5000,
        }
    }
}

impl MasterConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path.as_ref())
    }

    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = Some(address.into());
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_failover(mut self, failover: FailoverConfig) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    pub fn with_definitions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.definitions_dir = Some(dir.into());
        self
    }

    /// URL other processes use to reach this master
    pub fn advertise_url(&self) -> String {
        http_url(self.advertise_address.as_deref().unwrap_or(&self.listen_address))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("master host must not be empty".to_string()));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }
        require_positive("delivery.retry_interval_ms", self.delivery.retry_interval_ms)?;
        require_positive(
            "failover.orphan_scan_interval_ms",
            self.failover.orphan_scan_interval_ms,
        )?;
        self.registry.validate()
    }
}

/// Configuration for a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Unique host name of this worker
    pub host: String,

    /// Address to listen on for HTTP frames (e.g., "0.0.0.0:5800")
    pub listen_address: String,

    /// Advertised address for masters to connect to
    /// If None, uses the listen_address
    pub advertise_address: Option<String>,

    /// Worker groups this worker serves
    pub groups: Vec<String>,

    pub registry: RegistryConfig,
    pub pool: PoolConfig,
    pub delivery: DeliveryConfig,

    /// Interval between heartbeat payload refreshes
    pub heartbeat_interval_ms: u64,

    /// Directory holding `inflight.json`. None disables restart reconciliation
    pub state_dir: Option<PathBuf>,

    /// Number of finished attempts remembered for dispatch dedup
    pub dedup_retention: usize,

    /// Timeout of one outbound HTTP request
    pub request_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "worker-1".to_string(),
            listen_address: "127.0.0.1:5800".to_string(),
            advertise_address: None,
            groups: vec!["default".to_string()],
            registry: RegistryConfig::default(),
            pool: PoolConfig::default(),
            delivery: DeliveryConfig::default(),
            heartbeat_interval_ms: 2000,
            state_dir: None,
            dedup_retention: 10_000,
            request_timeout_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path.as_ref())
    }

    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = Some(address.into());
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.pool.max_concurrent = max_concurrent;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn advertise_url(&self) -> String {
        http_url(self.advertise_address.as_deref().unwrap_or(&self.listen_address))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("worker host must not be empty".to_string()));
        }
        if self.pool.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.groups.is_empty() {
            return Err(ConfigError::Invalid(
                "worker must serve at least one group".to_string(),
            ));
        }
        require_positive("delivery.retry_interval_ms", self.delivery.retry_interval_ms)?;
        require_positive("heartbeat_interval_ms", self.heartbeat_interval_ms)?;
        self.registry.validate()
    }
}

/// Configuration for the coordination service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address to listen on (e.g., "0.0.0.0:5600")
    pub listen_address: String,

    /// Sessions without a keepalive for this long are expired
    pub session_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:5600".to_string(),
            session_timeout_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path.as_ref())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// The expiry sweep ticks every half session timeout
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout_ms < 2 {
            return Err(ConfigError::Invalid(
                "session_timeout_ms must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
