use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::model::time_bucket::Granularity;

/// Top-level configuration for a bucketeer node.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identity of this node.
    #[serde(default)]
    pub node: NodeConfig,

    /// Cluster membership.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Node-to-node transport.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// HTTP span receiver.
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Worker queue sizing and flush cadence.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Which time granularities each observation is folded into.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Storage engine and batch gateway.
    #[serde(default)]
    pub storage: StorageConfig,

    /// History cleanup.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Identity of this node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Name used in logs. Default: "bucketeer-0".
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Address peers use to reach this node's remote listener. Must appear in
    /// `cluster.peers` when peers are configured.
    #[serde(default = "default_remote_addr")]
    pub advertise_addr: String,
}

/// Cluster membership.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Static peer list including this node. Empty means single node.
    #[serde(default)]
    pub peers: Vec<String>,

    /// How often the topology provider is polled. Default: 30s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

/// Node-to-node transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Listen address for inbound peer connections. Default: "0.0.0.0:11800".
    #[serde(default = "default_remote_listen_addr")]
    pub listen_addr: String,

    /// Outbound frames buffered per peer (dropped if full). Default: 4096.
    #[serde(default = "default_remote_queue_size")]
    pub queue_size: usize,

    /// Timeout for establishing a peer connection. Default: 3s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Frame compression (none, snappy, zstd, gzip). Default: none.
    #[serde(default = "default_remote_compression")]
    pub compression: String,
}

/// HTTP span receiver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// Enable the receiver. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":12800".
    #[serde(default = "default_receiver_addr")]
    pub addr: String,
}

/// Queue and flush settings for one worker role.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerConfig {
    /// Bounded queue capacity. Default: 10000.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Flush tick interval. Default: 1s.
    #[serde(default = "default_worker_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Merge with stored state before writing (persistence roles only).
    /// Default: true.
    #[serde(default = "default_true")]
    pub need_merge_db_data: bool,
}

/// Per-role overrides of [`WorkerConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerOverride {
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    #[serde(default, with = "humantime_serde")]
    pub flush_interval: Option<Duration>,

    #[serde(default)]
    pub need_merge_db_data: Option<bool>,
}

/// Worker settings, defaulted then overridden per role.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub default: WorkerConfig,

    /// Overrides keyed by role name.
    #[serde(default)]
    pub roles: HashMap<String, WorkerOverride>,
}

/// Analysis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Granularities each observation is folded into. Default: all four.
    #[serde(default = "default_granularities")]
    pub granularities: Vec<Granularity>,
}

/// Storage engine selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    #[default]
    Memory,
    ClickHouse,
    Elasticsearch,
}

impl StorageEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::ClickHouse => "clickhouse",
            Self::Elasticsearch => "elasticsearch",
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Engine to write to. Default: memory.
    #[serde(default)]
    pub engine: StorageEngine,

    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Native protocol endpoint (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Database name. Default: "bucketeer".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,
}

/// Elasticsearch connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticsearchConfig {
    /// Base URL, e.g. "http://localhost:9200".
    #[serde(default)]
    pub address: String,

    /// Prefix prepended to every index name.
    #[serde(default)]
    pub index_prefix: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request compression (none, gzip). Default: none.
    #[serde(default = "default_remote_compression")]
    pub compression: String,

    /// Per-request timeout. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// How the batch gateway submits prepared writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// One request per submit call.
    #[default]
    Immediate,
    /// Queue and flush on count, volume or time.
    Buffered,
}

/// Batch gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Default: immediate.
    #[serde(default)]
    pub mode: BatchMode,

    /// Flush when this many operations are queued. Default: 5000.
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,

    /// Flush when queued payloads reach this many bytes. Default: 5MiB.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Flush at least this often. Default: 1s.
    #[serde(default = "default_batch_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Maximum batches in flight. Default: 2.
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,

    /// Retries of a transient failure before giving up. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay. Default: 100ms.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Retry delay ceiling. Default: 5s.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Operations queued before submits are dropped. Default: 20000.
    #[serde(default = "default_batch_queue_size")]
    pub queue_size: usize,
}

/// History cleanup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the keeper runs. Default: 5m.
    #[serde(default = "default_retention_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Days kept for hour, day and month tables. Default: 7.
    #[serde(default = "default_metrics_ttl_days")]
    pub metrics_ttl_days: u32,

    /// Days kept for minute tables. Default: 1.
    #[serde(default = "default_minute_ttl_days")]
    pub minute_ttl_days: u32,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_id() -> String {
    "bucketeer-0".to_string()
}

fn default_remote_addr() -> String {
    "127.0.0.1:11800".to_string()
}

fn default_remote_listen_addr() -> String {
    "0.0.0.0:11800".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_remote_queue_size() -> usize {
    4096
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_remote_compression() -> String {
    "none".to_string()
}

fn default_true() -> bool {
    true
}

fn default_receiver_addr() -> String {
    ":12800".to_string()
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_worker_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_granularities() -> Vec<Granularity> {
    Granularity::ALL.to_vec()
}

fn default_database() -> String {
    "bucketeer".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_actions() -> usize {
    5000
}

fn default_max_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_batch_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_concurrent_requests() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_batch_queue_size() -> usize {
    20_000
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_metrics_ttl_days() -> u32 {
    7
}

fn default_minute_ttl_days() -> u32 {
    1
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node: NodeConfig::default(),
            cluster: ClusterConfig::default(),
            remote: RemoteConfig::default(),
            receiver: ReceiverConfig::default(),
            workers: WorkersConfig::default(),
            analysis: AnalysisConfig::default(),
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            advertise_addr: default_remote_addr(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_remote_listen_addr(),
            queue_size: default_remote_queue_size(),
            connect_timeout: default_connect_timeout(),
            compression: default_remote_compression(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_receiver_addr(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            flush_interval: default_worker_flush_interval(),
            need_merge_db_data: true,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            granularities: default_granularities(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            index_prefix: String::new(),
            username: String::new(),
            password: String::new(),
            headers: HashMap::new(),
            compression: default_remote_compression(),
            timeout: default_request_timeout(),
            keep_alive: true,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            max_actions: default_max_actions(),
            max_bytes: default_max_bytes(),
            flush_interval: default_batch_flush_interval(),
            concurrent_requests: default_concurrent_requests(),
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            queue_size: default_batch_queue_size(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_retention_interval(),
            metrics_ttl_days: default_metrics_ttl_days(),
            minute_ttl_days: default_minute_ttl_days(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl WorkersConfig {
    /// Effective settings for `role`.
    pub fn for_role(&self, role: &str) -> WorkerConfig {
        let mut cfg = self.default.clone();
        if let Some(o) = self.roles.get(role) {
            if let Some(capacity) = o.queue_capacity {
                cfg.queue_capacity = capacity;
            }
            if let Some(interval) = o.flush_interval {
                cfg.flush_interval = interval;
            }
            if let Some(merge) = o.need_merge_db_data {
                cfg.need_merge_db_data = merge;
            }
        }
        cfg
    }
}

// --- Validation and loading ---

const COMPRESSIONS: [&str; 4] = ["none", "snappy", "zstd", "gzip"];

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            bail!("node.id is required");
        }

        if self.node.advertise_addr.is_empty() {
            bail!("node.advertise_addr is required");
        }

        if !self.cluster.peers.is_empty()
            && !self.cluster.peers.contains(&self.node.advertise_addr)
        {
            bail!(
                "cluster.peers must include node.advertise_addr ({})",
                self.node.advertise_addr
            );
        }

        if self.cluster.refresh_interval.is_zero() {
            bail!("cluster.refresh_interval must be positive");
        }

        if self.remote.queue_size == 0 {
            bail!("remote.queue_size must be positive");
        }

        if !COMPRESSIONS.contains(&self.remote.compression.as_str()) {
            bail!("invalid remote.compression: {}", self.remote.compression);
        }

        validate_worker("workers.default", &self.workers.default)?;
        for role in self.workers.roles.keys() {
            validate_worker(&format!("workers.roles.{role}"), &self.workers.for_role(role))?;
        }

        if self.analysis.granularities.is_empty() {
            bail!("analysis.granularities must not be empty");
        }

        match self.storage.engine {
            StorageEngine::Memory => {}
            StorageEngine::ClickHouse => {
                if self.storage.clickhouse.endpoint.is_empty() {
                    bail!("storage.clickhouse.endpoint is required");
                }
            }
            StorageEngine::Elasticsearch => {
                if self.storage.elasticsearch.address.is_empty() {
                    bail!("storage.elasticsearch.address is required");
                }
                match self.storage.elasticsearch.compression.as_str() {
                    "none" | "gzip" => {}
                    other => bail!("invalid storage.elasticsearch.compression: {other}"),
                }
            }
        }

        let batch = &self.storage.batch;
        if batch.max_actions == 0 {
            bail!("storage.batch.max_actions must be positive");
        }
        if batch.concurrent_requests == 0 {
            bail!("storage.batch.concurrent_requests must be positive");
        }
        if batch.mode == BatchMode::Buffered {
            if batch.queue_size == 0 {
                bail!("storage.batch.queue_size must be positive when buffered");
            }
            if batch.flush_interval.is_zero() {
                bail!("storage.batch.flush_interval must be positive when buffered");
            }
        }
        if batch.initial_backoff > batch.max_backoff {
            bail!("storage.batch.initial_backoff must not exceed max_backoff");
        }

        if self.retention.enabled {
            if self.retention.interval.is_zero() {
                bail!("retention.interval must be positive");
            }
            if self.retention.metrics_ttl_days == 0 || self.retention.minute_ttl_days == 0 {
                bail!("retention ttl days must be positive");
            }
        }

        Ok(())
    }

    /// Ordered cluster member addresses; a lone node when no peers are set.
    pub fn peer_addresses(&self) -> Vec<String> {
        if self.cluster.peers.is_empty() {
            vec![self.node.advertise_addr.clone()]
        } else {
            self.cluster.peers.clone()
        }
    }
}

fn validate_worker(path: &str, cfg: &WorkerConfig) -> Result<()> {
    if cfg.queue_capacity == 0 {
        bail!("{path}.queue_capacity must be positive");
    }
    if cfg.flush_interval.is_zero() {
        bail!("{path}.flush_interval must be positive");
    }
    Ok(())
}
