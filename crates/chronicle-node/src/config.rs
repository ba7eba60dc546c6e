//! Node and cluster configuration.
//!
//! Loaded from `CHRONICLE_*` environment variables or a JSON file. Every
//! field has a default so partial files and sparse environments work.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chronicle_clock::{ClockConfig, ClockMode};
use chronicle_directory::PeerInfo;
use chronicle_protocols::{Ed25519Signer, NoopSigner, Signer};
use chronicle_types::{Duty, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// How a node proves who it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// Ed25519 keys; ids are BLAKE3 of the public key.
    #[default]
    Ed25519,
    /// No signatures; ids derived from the listen address.
    Disabled,
}

/// A known neighbor: hex node id and address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborConfig {
    pub id: String,
    pub addr: SocketAddr,
}

impl NeighborConfig {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id: id.to_hex(),
            addr,
        }
    }

    pub fn node_id(&self) -> Result<NodeId, ConfigError> {
        NodeId::from_hex(&self.id).map_err(|e| invalid("neighbor id", format!("{}: {e}", self.id)))
    }

    /// Directory entry with timestamp 0, so any live announcement replaces it.
    pub fn to_peer_info(&self, duty: Duty) -> Result<PeerInfo, ConfigError> {
        let mut info = PeerInfo::new(self.node_id()?, self.addr, duty);
        info.timestamp = 0;
        Ok(info)
    }

    /// Parse `"<hex id>@<addr>"`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (id, addr) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| invalid("neighbor", format!("expected id@addr, got {s}")))?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid("neighbor addr", format!("{addr}: {e}")))?;
        let neighbor = Self {
            id: id.to_string(),
            addr,
        };
        neighbor.node_id()?;
        Ok(neighbor)
    }
}

/// Bounds of the random delay added to every outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencyRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// Parse `"min-max"` or a single value.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| invalid("send_latency_ms", format!("{v}: {e}")))
        };
        match s.split_once('-') {
            Some((min, max)) => Ok(Self::new(parse(min)?, parse(max)?)),
            None => {
                let v = parse(s)?;
                Ok(Self::new(v, v))
            }
        }
    }
}

impl Default for LatencyRange {
    fn default() -> Self {
        Self::new(10, 50)
    }
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub duty: Duty,
    pub listen_addr: SocketAddr,
    pub signing: SigningMode,
    /// Hex Ed25519 seed; a fresh key is generated when absent.
    pub secret_key_hex: Option<String>,
    pub tick_ms: u64,
    pub clock_mode: ClockMode,
    /// Startup waits give up after this many ticks.
    pub startup_timeout_ticks: u32,
    pub seeds: Vec<NeighborConfig>,
    /// Fallback neighbors when no seed answers.
    pub peers: Vec<NeighborConfig>,
    pub max_block_txs: usize,
    pub send_latency_ms: LatencyRange,
    pub channel_capacity: usize,
    /// Directory database path (needs the `rocksdb` feature).
    pub peer_store_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            duty: Duty::Peer,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            signing: SigningMode::Ed25519,
            secret_key_hex: None,
            tick_ms: 1000,
            clock_mode: ClockMode::DriftCorrected,
            startup_timeout_ticks: 2,
            seeds: Vec::new(),
            peers: Vec::new(),
            max_block_txs: 256,
            send_latency_ms: LatencyRange::default(),
            channel_capacity: 1024,
            peer_store_path: None,
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("CHRONICLE_DUTY") {
            config.duty = v.parse().map_err(|e: String| invalid("duty", e))?;
        }
        if let Some(v) = lookup("CHRONICLE_LISTEN_ADDR") {
            config.listen_addr = v
                .parse::<SocketAddr>()
                .map_err(|e| invalid("listen_addr", format!("{v}: {e}")))?;
        }
        if let Some(v) = lookup("CHRONICLE_SIGNING") {
            config.signing = match v.trim() {
                "ed25519" => SigningMode::Ed25519,
                "disabled" | "none" => SigningMode::Disabled,
                other => return Err(invalid("signing", format!("unknown mode {other}"))),
            };
        }
        config.secret_key_hex = lookup("CHRONICLE_SECRET_KEY").filter(|s| !s.is_empty());
        if let Some(v) = lookup("CHRONICLE_TICK_MS") {
            config.tick_ms = parse_num("tick_ms", &v)?;
        }
        if let Some(v) = lookup("CHRONICLE_CLOCK_MODE") {
            config.clock_mode = match v.trim() {
                "drift_corrected" => ClockMode::DriftCorrected,
                "free_running" => ClockMode::FreeRunning,
                other => return Err(invalid("clock_mode", format!("unknown mode {other}"))),
            };
        }
        if let Some(v) = lookup("CHRONICLE_STARTUP_TIMEOUT_TICKS") {
            config.startup_timeout_ticks = parse_num("startup_timeout_ticks", &v)?;
        }
        if let Some(v) = lookup("CHRONICLE_SEEDS") {
            config.seeds = parse_neighbors(&v)?;
        }
        if let Some(v) = lookup("CHRONICLE_PEERS") {
            config.peers = parse_neighbors(&v)?;
        }
        if let Some(v) = lookup("CHRONICLE_MAX_BLOCK_TXS") {
            config.max_block_txs = parse_num("max_block_txs", &v)?;
        }
        if let Some(v) = lookup("CHRONICLE_SEND_LATENCY_MS") {
            config.send_latency_ms = LatencyRange::parse(&v)?;
        }
        if let Some(v) = lookup("CHRONICLE_CHANNEL_CAPACITY") {
            config.channel_capacity = parse_num("channel_capacity", &v)?;
        }
        config.peer_store_path = lookup("CHRONICLE_PEER_STORE").map(PathBuf::from);
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms < 10 {
            return Err(invalid("tick_ms", "must be at least 10"));
        }
        if self.startup_timeout_ticks == 0 {
            return Err(invalid("startup_timeout_ticks", "must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity", "must be positive"));
        }
        let latency = self.send_latency_ms;
        if latency.min_ms > latency.max_ms {
            return Err(invalid("send_latency_ms", "min exceeds max"));
        }
        if latency.max_ms >= self.tick_ms {
            return Err(invalid("send_latency_ms", "must stay below one tick"));
        }
        for neighbor in self.seeds.iter().chain(&self.peers) {
            neighbor.node_id()?;
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn clock_config(&self) -> ClockConfig {
        ClockConfig::new(self.tick(), self.clock_mode)
    }

    /// Upper bound for each startup wait.
    pub fn startup_timeout(&self) -> Duration {
        self.tick() * self.startup_timeout_ticks
    }

    /// Build the signer this config describes.
    pub fn signer(&self) -> Result<Arc<dyn Signer>, ConfigError> {
        match self.signing {
            SigningMode::Disabled => Ok(Arc::new(NoopSigner::new(NodeId::derive(
                self.listen_addr.to_string().as_bytes(),
            )))),
            SigningMode::Ed25519 => match &self.secret_key_hex {
                Some(secret) => Ed25519Signer::from_secret_hex(secret)
                    .map(|s| Arc::new(s) as Arc<dyn Signer>)
                    .map_err(|e| invalid("secret_key_hex", e.to_string())),
                None => Ok(Arc::new(Ed25519Signer::generate())),
            },
        }
    }
}

fn parse_num<T>(field: &'static str, v: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    v.trim()
        .parse()
        .map_err(|e: T::Err| invalid(field, format!("{v}: {e}")))
}

fn parse_neighbors(v: &str) -> Result<Vec<NeighborConfig>, ConfigError> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(NeighborConfig::parse)
        .collect()
}

/// Configuration of an in-process cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub seeds: usize,
    pub peers: usize,
    pub tick_ms: u64,
    /// Rounds to run before shutting down (binary only).
    pub rounds: u64,
    pub clock_mode: ClockMode,
    pub signing: SigningMode,
    pub send_latency_ms: LatencyRange,
    pub startup_timeout_ticks: u32,
    /// First port of the synthetic address range.
    pub base_port: u16,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: 1,
            peers: 3,
            tick_ms: 500,
            rounds: 10,
            clock_mode: ClockMode::DriftCorrected,
            signing: SigningMode::Ed25519,
            send_latency_ms: LatencyRange::new(5, 25),
            startup_timeout_ticks: 2,
            base_port: 7000,
        }
    }
}

impl ClusterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("CHRONICLE_CLUSTER_SEEDS") {
            config.seeds = parse_num("seeds", &v)?;
        }
        if let Some(v) = lookup("CHRONICLE_CLUSTER_PEERS") {
            config.peers = parse_num("peers", &v)?;
        }
        if let Some(v) = lookup("CHRONICLE_TICK_MS") {
            config.tick_ms = parse_num("tick_ms", &v)?;
        }
        if let Some(v) = lookup("CHRONICLE_ROUNDS") {
            config.rounds = parse_num("rounds", &v)?;
        }
        if let Some(v) = lookup("CHRONICLE_SEND_LATENCY_MS") {
            config.send_latency_ms = LatencyRange::parse(&v)?;
        }
        if lookup("CHRONICLE_SIGNING").is_some_and(|v| v.trim() == "disabled") {
            config.signing = SigningMode::Disabled;
        }
        if lookup("CHRONICLE_CLOCK_MODE").is_some_and(|v| v.trim() == "free_running") {
            config.clock_mode = ClockMode::FreeRunning;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seeds == 0 {
            return Err(invalid("seeds", "a cluster needs at least one seed"));
        }
        self.node_template(Duty::Seed, self.base_port).validate()
    }

    /// Per-node config with cluster-wide settings applied.
    pub fn node_template(&self, duty: Duty, port: u16) -> NodeConfig {
        NodeConfig {
            duty,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            signing: self.signing,
            tick_ms: self.tick_ms,
            clock_mode: self.clock_mode,
            startup_timeout_ticks: self.startup_timeout_ticks,
            send_latency_ms: self.send_latency_ms,
            ..NodeConfig::default()
        }
    }
}
