//! Node configuration with TOML file support.

use crate::error::{NodeError, Result};
use crate::logging::LogFormat;
use powchain_chain::{BlockchainConfig, MempoolConfig, MinerConfig};
use powchain_consensus::{ConsensusParams, DifficultyConfig};
use powchain_core::Address;
use powchain_network::{NetworkConfig, NodeRole};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A balance minted by the genesis block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAllocation {
    /// Hex address.
    pub address: String,
    pub amount: u64,
}

/// Configuration for a powchain node.
///
/// Loaded from a TOML file via [`NodeConfig::from_toml_file`]; every key is
/// optional. Command-line flags override file values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    // ── Network ──────────────────────────────────────────────────────
    /// `initial`, `regular` or `bootstrap-secondary`.
    #[serde(default)]
    pub role: NodeRole,

    /// Peer to bootstrap from (`host:port`).
    #[serde(default)]
    pub bootstrap: Option<String>,

    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address advertised to peers. Derived from `listen_addr` when unset.
    #[serde(default)]
    pub advertised_addr: Option<String>,

    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Consecutive failures before a peer is evicted.
    #[serde(default = "default_peer_failure_threshold")]
    pub peer_failure_threshold: u32,

    #[serde(default = "default_blacklist_secs")]
    pub blacklist_secs: u64,

    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: u64,

    // ── Chain ────────────────────────────────────────────────────────
    /// Data directory for the chain store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_target_block_interval_secs")]
    pub target_block_interval_secs: u64,

    /// Leading zero bits required of the genesis child.
    #[serde(default = "default_initial_difficulty")]
    pub initial_difficulty: u32,

    /// Intervals shorter than this raise the difficulty.
    #[serde(default = "default_adjustment_lower_bound_secs")]
    pub adjustment_lower_bound_secs: u64,

    /// Intervals longer than this lower the difficulty.
    #[serde(default = "default_adjustment_upper_bound_secs")]
    pub adjustment_upper_bound_secs: u64,

    #[serde(default = "default_max_transactions_per_block")]
    pub max_transactions_per_block: usize,

    /// Bytes, bincode-encoded.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    #[serde(default = "default_mining_reward")]
    pub mining_reward: u64,

    #[serde(default = "default_max_amount")]
    pub max_amount: u64,

    #[serde(default = "default_max_fee")]
    pub max_fee: u64,

    #[serde(default = "default_max_future_drift_secs")]
    pub max_future_drift_secs: u64,

    #[serde(default = "default_max_fork_depth")]
    pub max_fork_depth: u64,

    #[serde(default = "default_max_orphans")]
    pub max_orphans: usize,

    #[serde(default = "default_orphan_ttl_secs")]
    pub orphan_ttl_secs: u64,

    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    #[serde(default = "default_pool_max_per_account")]
    pub pool_max_per_account: usize,

    #[serde(default = "default_tx_max_age_secs")]
    pub tx_max_age_secs: u64,

    // ── Mining ───────────────────────────────────────────────────────
    /// Reward address. Mining is off when unset.
    #[serde(default)]
    pub miner_address: Option<String>,

    #[serde(default)]
    pub mine_empty_blocks: bool,

    #[serde(default = "default_nonce_batch")]
    pub nonce_batch: u64,

    // ── Logging ──────────────────────────────────────────────────────
    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter, e.g. "info" or "debug,powchain_network=trace".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // ── Genesis ──────────────────────────────────────────────────────
    /// Must stay the last field: TOML tables follow plain keys.
    #[serde(default)]
    pub genesis_allocations: Vec<GenesisAllocation>,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_listen_addr() -> String {
    "0.0.0.0:8333".to_string()
}

fn default_max_peers() -> usize {
    32
}

fn default_peer_failure_threshold() -> u32 {
    3
}

fn default_blacklist_secs() -> u64 {
    600
}

fn default_liveness_interval_secs() -> u64 {
    30
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_broadcast_timeout_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_sync_batch_size() -> u64 {
    100
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./powchain_data")
}

fn default_target_block_interval_secs() -> u64 {
    3_600
}

fn default_initial_difficulty() -> u32 {
    4
}

fn default_adjustment_lower_bound_secs() -> u64 {
    1_800
}

fn default_adjustment_upper_bound_secs() -> u64 {
    7_200
}

fn default_max_transactions_per_block() -> usize {
    100
}

fn default_max_block_size() -> usize {
    1_000_000
}

fn default_mining_reward() -> u64 {
    50
}

fn default_max_amount() -> u64 {
    1_000_000_000
}

fn default_max_fee() -> u64 {
    1_000_000
}

fn default_max_future_drift_secs() -> u64 {
    7_200
}

fn default_max_fork_depth() -> u64 {
    64
}

fn default_max_orphans() -> usize {
    256
}

fn default_orphan_ttl_secs() -> u64 {
    600
}

fn default_pool_capacity() -> usize {
    10_000
}

fn default_pool_max_per_account() -> usize {
    100
}

fn default_tx_max_age_secs() -> u64 {
    86_400
}

fn default_nonce_batch() -> u64 {
    10_000
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("NodeConfig is always serializable to TOML")
    }

    /// Replace the port of `listen_addr`.
    pub fn set_port(&mut self, port: u16) {
        let host = self
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        self.listen_addr = format!("{host}:{port}");
    }

    /// The address peers should dial. A wildcard bind host is replaced by
    /// loopback.
    pub fn advertised(&self) -> String {
        if let Some(addr) = &self.advertised_addr {
            return addr.clone();
        }
        match self.listen_addr.rsplit_once(':') {
            Some(("0.0.0.0" | "[::]" | "", port)) => format!("127.0.0.1:{port}"),
            _ => self.listen_addr.clone(),
        }
    }

    pub fn log_format(&self) -> Result<LogFormat> {
        self.log_format.parse().map_err(NodeError::Config)
    }

    pub fn blockchain_config(&self) -> Result<BlockchainConfig> {
        if self.initial_difficulty == 0 {
            return Err(NodeError::Config("initial_difficulty must be at least 1".into()));
        }
        if self.adjustment_lower_bound_secs > self.adjustment_upper_bound_secs {
            return Err(NodeError::Config(
                "adjustment_lower_bound_secs exceeds adjustment_upper_bound_secs".into(),
            ));
        }

        let genesis_allocations = self
            .genesis_allocations
            .iter()
            .map(|alloc| {
                Address::from_hex(&alloc.address)
                    .map(|address| (address, alloc.amount))
                    .map_err(|e| {
                        NodeError::Config(format!("genesis allocation {}: {e}", alloc.address))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BlockchainConfig {
            consensus: ConsensusParams {
                max_amount: self.max_amount,
                max_fee: self.max_fee,
                mining_reward: self.mining_reward,
                max_transactions_per_block: self.max_transactions_per_block,
                max_block_size: self.max_block_size,
                max_future_drift: self.max_future_drift_secs,
            },
            difficulty: DifficultyConfig {
                target_interval: self.target_block_interval_secs,
                lower_bound: self.adjustment_lower_bound_secs,
                upper_bound: self.adjustment_upper_bound_secs,
                initial_difficulty: self.initial_difficulty,
            },
            mempool: MempoolConfig {
                max_transactions: self.pool_capacity,
                max_per_account: self.pool_max_per_account,
            },
            max_fork_depth: self.max_fork_depth,
            max_orphans: self.max_orphans,
            orphan_ttl: Duration::from_secs(self.orphan_ttl_secs),
            tx_max_age: self.tx_max_age_secs,
            genesis_allocations,
        })
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            role: self.role,
            bootstrap: self.bootstrap.clone(),
            advertised_addr: Some(self.advertised()),
            max_peers: self.max_peers,
            failure_threshold: self.peer_failure_threshold,
            blacklist_duration: Duration::from_secs(self.blacklist_secs),
            liveness_interval: Duration::from_secs(self.liveness_interval_secs.max(1)),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            broadcast_timeout: Duration::from_millis(self.broadcast_timeout_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            sync_batch_size: self.sync_batch_size,
            max_fork_depth: self.max_fork_depth,
        }
    }

    /// `None` when no miner address is configured.
    pub fn miner_config(&self) -> Result<Option<MinerConfig>> {
        let Some(address) = &self.miner_address else {
            return Ok(None);
        };
        let address = Address::from_hex(address)
            .map_err(|e| NodeError::Config(format!("miner_address {address}: {e}")))?;
        Ok(Some(MinerConfig {
            nonce_batch: self.nonce_batch,
            mine_empty_blocks: self.mine_empty_blocks,
            ..MinerConfig::new(address)
        }))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::default(),
            bootstrap: None,
            listen_addr: default_listen_addr(),
            advertised_addr: None,
            max_peers: default_max_peers(),
            peer_failure_threshold: default_peer_failure_threshold(),
            blacklist_secs: default_blacklist_secs(),
            liveness_interval_secs: default_liveness_interval_secs(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            broadcast_timeout_ms: default_broadcast_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            sync_batch_size: default_sync_batch_size(),
            data_dir: default_data_dir(),
            target_block_interval_secs: default_target_block_interval_secs(),
            initial_difficulty: default_initial_difficulty(),
            adjustment_lower_bound_secs: default_adjustment_lower_bound_secs(),
            adjustment_upper_bound_secs: default_adjustment_upper_bound_secs(),
            max_transactions_per_block: default_max_transactions_per_block(),
            max_block_size: default_max_block_size(),
            mining_reward: default_mining_reward(),
            max_amount: default_max_amount(),
            max_fee: default_max_fee(),
            max_future_drift_secs: default_max_future_drift_secs(),
            max_fork_depth: default_max_fork_depth(),
            max_orphans: default_max_orphans(),
            orphan_ttl_secs: default_orphan_ttl_secs(),
            pool_capacity: default_pool_capacity(),
            pool_max_per_account: default_pool_max_per_account(),
            tx_max_age_secs: default_tx_max_age_secs(),
            genesis_allocations: Vec::new(),
            miner_address: None,
            mine_empty_blocks: false,
            nonce_batch: default_nonce_batch(),
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}
