//! Configuration types for a ferry node.

use crate::error::{Error, Result};
use crate::types::PeerId;
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "FERRY__";

/// Main configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this peer. Random when not configured.
    pub peer_id: PeerId,

    /// Address the peer transport binds to.
    pub listen_addr: SocketAddr,

    /// Address other peers use to reach this node. Defaults to `listen_addr`.
    pub advertise_addr: Option<String>,

    /// Address of a peer to join on startup. `None` bootstraps a new cluster.
    pub bootstrap: Option<String>,

    /// Whether distributed mode is enabled.
    pub cluster_enabled: bool,

    /// Directory for node metadata (transfer journal, ownership map).
    pub storage_path: PathBuf,

    /// Directory for staged snapshot blobs.
    pub snapshots_path: PathBuf,

    /// Interval between peer health checks.
    pub health_check_interval: Duration,

    /// Consecutive failed health checks before a peer is marked dead.
    pub failure_threshold: u32,

    /// Shard store configuration.
    pub store: StoreConfig,

    /// Shard transfer configuration.
    pub transfer: TransferConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: rand::thread_rng().gen_range(1..=u32::MAX as PeerId),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 6335)),
            advertise_addr: None,
            bootstrap: None,
            cluster_enabled: true,
            storage_path: PathBuf::from("./storage"),
            snapshots_path: PathBuf::from("./snapshots"),
            health_check_interval: Duration::from_secs(1),
            failure_threshold: 3,
            store: StoreConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a new configuration with the given peer ID and address.
    pub fn new(peer_id: PeerId, listen_addr: SocketAddr) -> Self {
        Self {
            peer_id,
            listen_addr,
            ..Default::default()
        }
    }

    /// Apply `FERRY__*` environment overrides on top of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`.
    ///
    /// Recognised keys: `FERRY__STORAGE__STORAGE_PATH`,
    /// `FERRY__STORAGE__SNAPSHOTS_PATH`, `FERRY__SERVICE__HOST` and
    /// `FERRY__CLUSTER__ENABLED`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = |suffix: &str| format!("{}{}", ENV_PREFIX, suffix);

        if let Some(path) = lookup(&key("STORAGE__STORAGE_PATH")) {
            self.storage_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(&key("STORAGE__SNAPSHOTS_PATH")) {
            self.snapshots_path = PathBuf::from(path);
        }
        if let Some(host) = lookup(&key("SERVICE__HOST")) {
            let ip = host
                .parse()
                .map_err(|_| Error::Config(format!("invalid service host: {}", host)))?;
            self.listen_addr.set_ip(ip);
        }
        if let Some(enabled) = lookup(&key("CLUSTER__ENABLED")) {
            self.cluster_enabled = parse_bool(&enabled).ok_or_else(|| {
                Error::Config(format!("invalid cluster enabled flag: {}", enabled))
            })?;
        }
        Ok(self)
    }

    /// Set the listen address from a peer URI such as `http://10.0.0.1:6335`.
    pub fn with_uri(mut self, uri: &str) -> Result<Self> {
        let host_port = strip_scheme(uri);
        self.listen_addr = host_port
            .parse()
            .map_err(|_| Error::Config(format!("invalid peer uri: {}", uri)))?;
        self.advertise_addr = Some(host_port.to_string());
        Ok(self)
    }

    /// Set the bootstrap peer address.
    pub fn with_bootstrap(mut self, addr: impl Into<String>) -> Self {
        self.bootstrap = Some(strip_scheme(&addr.into()).to_string());
        self
    }

    /// Set the storage directory.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Set the snapshot staging directory.
    pub fn with_snapshots_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshots_path = path.into();
        self
    }

    /// Set the health check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the store configuration.
    pub fn with_store_config(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set the transfer configuration.
    pub fn with_transfer_config(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Address advertised to other peers.
    pub fn advertised(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }

    /// Check the configuration for values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.peer_id == 0 {
            return Err(Error::Config("peer_id must be non-zero".into()));
        }
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be at least 1".into()));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::Config("health_check_interval must be non-zero".into()));
        }
        self.store.validate()?;
        self.transfer.validate()
    }
}

fn strip_scheme(uri: &str) -> &str {
    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))
        .or_else(|| uri.strip_prefix("tcp://"))
        .unwrap_or(uri);
    rest.trim_end_matches('/')
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Shard store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum WAL records retained per replica (0 = unbounded).
    pub wal_retention: usize,

    /// Whether snapshot bodies are LZ4 compressed.
    pub compress_snapshots: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            wal_retention: 10_000,
            compress_snapshots: true,
        }
    }
}

impl StoreConfig {
    /// Set WAL retention.
    pub fn with_wal_retention(mut self, retention: usize) -> Self {
        self.wal_retention = retention;
        self
    }

    /// Enable or disable snapshot compression.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_snapshots = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Shard transfer configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Maximum transfers running at once on this coordinator.
    pub max_concurrent_transfers: usize,

    /// Maximum transfers a single peer may take part in (as source or
    /// destination) at once.
    pub max_transfers_per_peer: usize,

    /// WAL records shipped per batch.
    pub batch_size: usize,

    /// Bandwidth cap in bytes per second (0 = unlimited).
    pub max_bytes_per_sec: u64,

    /// Cutover starts once the destination is at most this many records
    /// behind the source.
    pub cutover_lag: u64,

    /// Catch-up rounds before giving up on converging.
    pub max_catchup_rounds: usize,

    /// Deadline for the whole cutover window.
    pub cutover_timeout: Duration,

    /// Deadline for a routed client write, including retries.
    pub write_timeout: Duration,

    /// Initial backoff between write retries.
    pub retry_backoff: Duration,

    /// Stage snapshot blobs through this directory when set.
    pub snapshots_path: Option<PathBuf>,

    /// Finalized transfers kept in history.
    pub history_limit: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 8,
            max_transfers_per_peer: 2,
            batch_size: 256,
            max_bytes_per_sec: 0,
            cutover_lag: 64,
            max_catchup_rounds: 100,
            cutover_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(5),
            snapshots_path: None,
            history_limit: 128,
        }
    }
}

impl TransferConfig {
    /// Set the global concurrency limit.
    pub fn with_max_concurrent_transfers(mut self, limit: usize) -> Self {
        self.max_concurrent_transfers = limit;
        self
    }

    /// Set the per-peer concurrency limit.
    pub fn with_max_transfers_per_peer(mut self, limit: usize) -> Self {
        self.max_transfers_per_peer = limit;
        self
    }

    /// Set the WAL batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the bandwidth cap.
    pub fn with_max_bytes_per_sec(mut self, rate: u64) -> Self {
        self.max_bytes_per_sec = rate;
        self
    }

    /// Set the cutover lag threshold.
    pub fn with_cutover_lag(mut self, lag: u64) -> Self {
        self.cutover_lag = lag;
        self
    }

    /// Set the catch-up round limit.
    pub fn with_max_catchup_rounds(mut self, rounds: usize) -> Self {
        self.max_catchup_rounds = rounds;
        self
    }

    /// Set the routed write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Stage snapshots through a directory.
    pub fn with_snapshots_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshots_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_transfers == 0 {
            return Err(Error::Config(
                "max_concurrent_transfers must be at least 1".into(),
            ));
        }
        if self.max_transfers_per_peer == 0 {
            return Err(Error::Config("max_transfers_per_peer must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.max_catchup_rounds == 0 {
            return Err(Error::Config("max_catchup_rounds must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.cluster_enabled);
        assert_eq!(config.transfer.max_concurrent_transfers, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new(42, "127.0.0.1:7000".parse().unwrap())
            .with_bootstrap("http://127.0.0.1:6335/")
            .with_transfer_config(TransferConfig::default().with_batch_size(16));

        assert_eq!(config.peer_id, 42);
        assert_eq!(config.bootstrap.as_deref(), Some("127.0.0.1:6335"));
        assert_eq!(config.transfer.batch_size, 16);
        assert_eq!(config.advertised(), "127.0.0.1:7000");
    }

    #[test]
    fn test_with_uri() {
        let config = NodeConfig::new(1, "127.0.0.1:1".parse().unwrap())
            .with_uri("http://10.1.2.3:6335")
            .unwrap();
        assert_eq!(config.listen_addr, "10.1.2.3:6335".parse().unwrap());
        assert_eq!(config.advertised(), "10.1.2.3:6335");
        assert!(NodeConfig::default().with_uri("not a uri").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FERRY__STORAGE__STORAGE_PATH", "/data/storage"),
            ("FERRY__STORAGE__SNAPSHOTS_PATH", "/data/snapshots"),
            ("FERRY__SERVICE__HOST", "0.0.0.0"),
            ("FERRY__CLUSTER__ENABLED", "false"),
        ]
        .into_iter()
        .collect();

        let config = NodeConfig::new(1, "127.0.0.1:6335".parse().unwrap())
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.storage_path, PathBuf::from("/data/storage"));
        assert_eq!(config.snapshots_path, PathBuf::from("/data/snapshots"));
        assert_eq!(config.listen_addr, "0.0.0.0:6335".parse().unwrap());
        assert!(!config.cluster_enabled);
    }

    #[test]
    fn test_invalid_env_flag() {
        let result = NodeConfig::default().with_env_overrides(|k| {
            (k == "FERRY__CLUSTER__ENABLED").then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let transfer = TransferConfig::default().with_max_transfers_per_peer(0);
        assert!(transfer.validate().is_err());

        let config = NodeConfig {
            peer_id: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
