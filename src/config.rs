use std::collections::{BTreeMap, HashSet};
use std::fs;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::sources;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `config.json`.
//
// It defines:
// - Collection cadence and enabled sources
// - Shared HTTP pool limits
// - Upstream API endpoints and keys
// - The delivery sink
// - Optional quality checks and debug flags
//
// API keys may also come from the environment
// (ETHERSCAN_API_KEY, DEFIPULSE_API_KEY) and the environment wins.
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub apis: ApisConfig,

    /// ERC-20 contracts watched by the `erc20_transfers` source
    #[serde(default)]
    pub erc20_contracts: Vec<ContractConfig>,

    /// Downstream delivery target
    pub sink: SinkConfig,

    #[serde(default)]
    pub quality: QualityConfig,

    pub debug: Option<DebugConfig>,
}

// ------------------------------------------------------------
// Collection configuration
// ------------------------------------------------------------
//
// The fast variant polls every 10s and backs off 5s; the slow
// variant polls every 300s and backs off 60s. Both are just
// values here.
//
#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default)]
    pub mode: RunMode,

    /// Target cycle period in seconds
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Fixed delay after a failed cycle
    #[serde(default = "default_backoff")]
    pub backoff_seconds: u64,

    /// Number of blocks fetched by `recent_blocks`
    #[serde(default = "default_block_count")]
    pub recent_block_count: u64,

    /// Block range scanned by `erc20_transfers`, counted back from latest
    #[serde(default = "default_lookback")]
    pub transfer_lookback_blocks: u64,

    /// Enabled source slots, in registration order
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Continuous,
    Once,
}

// ------------------------------------------------------------
// HTTP pool configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Per-request timeout (connect + body)
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Upper bound on in-flight requests across all sources
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

// ------------------------------------------------------------
// Upstream API configuration
// ------------------------------------------------------------
//
// Endpoint URLs default to the public services and are mostly
// overridden in tests.
//
#[derive(Debug, Deserialize, Clone)]
pub struct ApisConfig {
    #[serde(default = "default_coingecko_url")]
    pub coingecko_url: String,

    #[serde(default = "default_etherscan_url")]
    pub etherscan_url: String,

    /// Required whenever an etherscan-backed source is enabled
    pub etherscan_key: Option<String>,

    /// Sent as `chainid` when set (etherscan multichain endpoints)
    pub etherscan_chain_id: Option<u64>,

    #[serde(default = "default_defipulse_url")]
    pub defipulse_url: String,

    /// Optional; the DeFi source is best-effort
    pub defipulse_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractConfig {
    /// Display name (e.g. "USDT")
    pub name: String,

    /// Checksummed or lowercase 0x address
    pub address: String,
}

// ------------------------------------------------------------
// Sink configuration
// ------------------------------------------------------------
//
// `kind` selects the producer:
// - redis:       XADD into a stream (message bus)
// - bulk_ingest: streaming-ingest REST endpoint of the analytical store
// - websocket:   persistent connections to a master service
// - stdout:      demo mode, envelopes are only logged
//
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(flatten)]
    pub kind: SinkKind,

    /// Partition key range: keys are in `0..partitions`
    #[serde(default = "default_partitions")]
    pub partitions: u64,

    #[serde(default)]
    pub envelope_mode: EnvelopeMode,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkKind {
    Redis(RedisSinkConfig),
    BulkIngest(BulkIngestConfig),
    Websocket(WebSocketSinkConfig),
    Stdout,
}

impl SinkKind {
    pub fn name(&self) -> &'static str {
        match self {
            SinkKind::Redis(_) => "redis",
            SinkKind::BulkIngest(_) => "bulk_ingest",
            SinkKind::Websocket(_) => "websocket",
            SinkKind::Stdout => "stdout",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeMode {
    /// One envelope per cycle carrying the whole record
    #[default]
    Combined,

    /// Combined envelope plus one tagged envelope per populated source
    PerSource,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisSinkConfig {
    /// e.g. "redis://127.0.0.1:6379"
    pub url: Option<String>,

    /// Target stream key
    pub stream: Option<String>,

    /// Approximate stream cap (`MAXLEN ~`)
    pub max_len: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BulkIngestConfig {
    /// Cluster base URL, e.g. "https://mycluster.westeurope.kusto.windows.net"
    pub endpoint: Option<String>,

    pub database: Option<String>,

    /// Table used for event types without an explicit mapping
    #[serde(default = "default_table")]
    pub default_table: String,

    /// Event type -> table
    #[serde(default)]
    pub tables: BTreeMap<String, String>,

    /// Bearer token, obtained out of band
    pub token: Option<String>,

    /// Gzip request bodies
    #[serde(default = "default_true")]
    pub gzip: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketSinkConfig {
    /// WebSocket URL of the master service
    pub url: Option<String>,

    /// Authentication key used during login
    /// (sent as: key=XYZ&role=collector)
    pub key: Option<String>,

    /// Number of parallel WebSocket connections to the master
    #[serde(default = "default_ws_connections")]
    pub connections: usize,
}

// ------------------------------------------------------------
// Quality checks
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    /// Run checks after every N delivered cycles (0 disables)
    #[serde(default)]
    pub every_cycles: u64,

    #[serde(default = "default_max_age")]
    pub max_age_minutes: i64,

    #[serde(default = "default_completeness_window")]
    pub completeness_window_minutes: i64,

    #[serde(default = "default_consistency_window")]
    pub consistency_window_minutes: i64,

    /// Largest tolerated change between consecutive prices (0.1 = 10%)
    #[serde(default = "default_max_change")]
    pub max_change_ratio: f64,
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Log every outgoing envelope body at debug level
    pub log_payloads: Option<bool>,
}

/// Blocks fetched one by one per cycle; bounded by the upstream rate limit
const MAX_RECENT_BLOCKS: u64 = 256;

const MAX_LOOKBACK_BLOCKS: u64 = 10_000;

/// One week
const MAX_QUALITY_WINDOW_MINUTES: i64 = 10_080;

fn default_interval() -> u64 {
    10
}

fn default_backoff() -> u64 {
    5
}

fn default_block_count() -> u64 {
    5
}

fn default_lookback() -> u64 {
    100
}

fn default_sources() -> Vec<String> {
    sources::DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    100
}

fn default_coingecko_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_etherscan_url() -> String {
    "https://api.etherscan.io/api".to_string()
}

fn default_defipulse_url() -> String {
    "https://api.defipulse.com/v1/egs".to_string()
}

fn default_partitions() -> u64 {
    10
}

fn default_table() -> String {
    "EthereumEvents".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ws_connections() -> usize {
    1
}

fn default_max_age() -> i64 {
    5
}

fn default_completeness_window() -> i64 {
    60
}

fn default_consistency_window() -> i64 {
    15
}

fn default_max_change() -> f64 {
    0.1
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            interval_seconds: default_interval(),
            backoff_seconds: default_backoff(),
            recent_block_count: default_block_count(),
            transfer_lookback_blocks: default_lookback(),
            sources: default_sources(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ApisConfig {
    fn default() -> Self {
        Self {
            coingecko_url: default_coingecko_url(),
            etherscan_url: default_etherscan_url(),
            etherscan_key: None,
            etherscan_chain_id: None,
            defipulse_url: default_defipulse_url(),
            defipulse_key: None,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            every_cycles: 0,
            max_age_minutes: default_max_age(),
            completeness_window_minutes: default_completeness_window(),
            consistency_window_minutes: default_consistency_window(),
            max_change_ratio: default_max_change(),
        }
    }
}

// ------------------------------------------------------------
// Loading
// ------------------------------------------------------------

impl Config {
    /// Reads, parses and validates a config file.
    ///
    /// Environment overrides are applied before validation so a key
    /// supplied only through the environment still satisfies it.
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;

        let mut cfg = Config::from_json(path, &data)?;
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(path: &str, data: &str) -> Result<Config, ConfigError> {
        serde_json::from_str(data).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ETHERSCAN_API_KEY").filter(|k| !k.is_empty()) {
            self.apis.etherscan_key = Some(key);
        }
        if let Some(key) = lookup("DEFIPULSE_API_KEY").filter(|k| !k.is_empty()) {
            self.apis.defipulse_key = Some(key);
        }
    }

    /// Checks every key the runtime reads without a default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.collection;

        if c.interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "collection.interval_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.http.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "http.max_connections",
                reason: "must be greater than zero".into(),
            });
        }
        if self.http.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "http.timeout_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if c.sources.is_empty() {
            return Err(ConfigError::Missing("collection.sources"));
        }

        let mut seen = HashSet::new();
        for name in &c.sources {
            if !sources::is_known(name) {
                return Err(ConfigError::Invalid {
                    key: "collection.sources",
                    reason: format!("unknown source '{}'", name),
                });
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid {
                    key: "collection.sources",
                    reason: format!("source '{}' listed twice", name),
                });
            }
        }

        let needs_etherscan = c
            .sources
            .iter()
            .any(|s| sources::ETHERSCAN_SOURCES.contains(&s.as_str()));
        if needs_etherscan && is_blank(&self.apis.etherscan_key) {
            return Err(ConfigError::Missing("apis.etherscan_key"));
        }

        if c.sources.iter().any(|s| s == sources::ERC20_TRANSFERS)
            && self.erc20_contracts.is_empty()
        {
            return Err(ConfigError::Missing("erc20_contracts"));
        }

        if !(1..=MAX_RECENT_BLOCKS).contains(&c.recent_block_count) {
            return Err(ConfigError::Invalid {
                key: "collection.recent_block_count",
                reason: format!("must be between 1 and {}", MAX_RECENT_BLOCKS),
            });
        }
        if c.transfer_lookback_blocks > MAX_LOOKBACK_BLOCKS {
            return Err(ConfigError::Invalid {
                key: "collection.transfer_lookback_blocks",
                reason: format!("must be at most {}", MAX_LOOKBACK_BLOCKS),
            });
        }

        if self.quality.every_cycles > 0 {
            self.quality.validate()?;
        }

        self.sink.validate()
    }

    pub fn log_payloads(&self) -> bool {
        self.debug
            .as_ref()
            .and_then(|d| d.log_payloads)
            .unwrap_or(false)
    }
}

impl QualityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let windows = [
            ("quality.max_age_minutes", self.max_age_minutes),
            ("quality.completeness_window_minutes", self.completeness_window_minutes),
            ("quality.consistency_window_minutes", self.consistency_window_minutes),
        ];
        for (key, minutes) in windows {
            if !(1..=MAX_QUALITY_WINDOW_MINUTES).contains(&minutes) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("must be between 1 and {} minutes", MAX_QUALITY_WINDOW_MINUTES),
                });
            }
        }

        if !self.max_change_ratio.is_finite() || self.max_change_ratio <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "quality.max_change_ratio",
                reason: "must be a positive number".into(),
            });
        }

        Ok(())
    }
}

impl SinkConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::Invalid {
                key: "sink.partitions",
                reason: "must be greater than zero".into(),
            });
        }

        match &self.kind {
            SinkKind::Redis(r) => {
                if is_blank(&r.url) {
                    return Err(ConfigError::Missing("sink.url"));
                }
                if is_blank(&r.stream) {
                    return Err(ConfigError::Missing("sink.stream"));
                }
            }
            SinkKind::BulkIngest(b) => {
                if is_blank(&b.endpoint) {
                    return Err(ConfigError::Missing("sink.endpoint"));
                }
                if is_blank(&b.database) {
                    return Err(ConfigError::Missing("sink.database"));
                }
            }
            SinkKind::Websocket(w) => {
                if is_blank(&w.url) {
                    return Err(ConfigError::Missing("sink.url"));
                }
                if is_blank(&w.key) {
                    return Err(ConfigError::Missing("sink.key"));
                }
                if w.connections == 0 {
                    return Err(ConfigError::Invalid {
                        key: "sink.connections",
                        reason: "must be greater than zero".into(),
                    });
                }
            }
            SinkKind::Stdout => {}
        }

        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
