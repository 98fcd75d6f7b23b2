use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tessera_common::checkpoint::DEFAULT_CSV_DELIMITER;

// bind addresses
pub const DEFAULT_P2P_BIND_ADDRESS: &str = "0.0.0.0:2690";

// Millis per second, to prevent having random 1000 values anywhere
pub const MILLIS_PER_SECOND: u64 = 1000;

// Chain sync rules
// maximum number of blocks in a single sync response
pub const MAX_SYNC_BATCH: usize = 100;
// a peer this many blocks ahead is bootstrapped through checkpoint sync
// instead of plain range sync
pub const CHECKPOINT_SYNC_THRESHOLD: u64 = MAX_SYNC_BATCH as u64 * 4;

// P2p rules
// maximum packet size set to 8 MiB, checkpoints with many accounts are
// the largest payloads on the wire
pub const PEER_MAX_PACKET_SIZE: u32 = 8 * 1024 * 1024;
// per-peer outbound frame channel size
pub const PEER_PACKET_CHANNEL_SIZE: usize = 1024;
// millis until an outbound send to a slow peer is abandoned
pub const PEER_SEND_TIMEOUT_MILLIS: u64 = 3_000;
// millis until the handshake of a fresh connection times out
pub const PEER_TIMEOUT_INIT_CONNECTION: u64 = 5_000;
// seconds without any frame before a peer is considered dead
pub const PEER_STALE_AFTER_SECONDS: u64 = 90;
// propagation caches per peer
pub const PEER_TX_CACHE_SIZE: usize = 1024;
pub const PEER_BLOCK_CACHE_SIZE: usize = 1024;
// fixed-window rate limit, frames per second per peer
pub const PEER_RATE_LIMIT_PER_SECOND: u32 = 256;

// Gossip rules
// fingerprints remembered for deduplicated rebroadcast
pub const GOSSIP_CACHE_SIZE: usize = 16_384;
// initial time-to-live of a propagated message
pub const GOSSIP_TTL: u8 = 8;
// maximum number of hops a message may accumulate before it is dropped
pub const GOSSIP_MAX_HOPS: u8 = 16;

// Mempool rules
pub const MEMPOOL_CAPACITY: usize = 10_000;

/// Runtime configuration of a node. Everything is optional in the JSON
/// file; missing keys fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer identity; derived from the wallet address when not set
    pub id: Option<String>,
    pub db_path: PathBuf,
    pub bind_address: SocketAddr,
    /// Discovery collaborator endpoint. Connection brokering is handled
    /// outside of this daemon; we only record the configured value.
    pub signaling_server: Option<String>,
    /// Peers we connect to on our own on every discovery tick
    pub priority_peers: Vec<SocketAddr>,
    pub max_peers: usize,
    pub min_peers: usize,
    pub discovery_interval_seconds: u64,
    pub chain: ChainConfig,
    pub checkpoint: CheckpointConfig,
    /// Genesis allocation: this address starts with the given amount,
    /// fully staked
    pub initial_stake_address: Option<String>,
    pub initial_stake_amount: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            db_path: PathBuf::from("tessera-db"),
            bind_address: DEFAULT_P2P_BIND_ADDRESS.parse().expect("valid default bind"),
            signaling_server: None,
            priority_peers: Vec::new(),
            max_peers: 32,
            min_peers: 2,
            discovery_interval_seconds: 10,
            chain: ChainConfig::default(),
            checkpoint: CheckpointConfig::default(),
            initial_stake_address: None,
            initial_stake_amount: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Miner tick in milliseconds
    pub block_time: u64,
    /// Maximum serialized block size in bytes
    pub max_block_size: usize,
    pub block_reward: u64,
    pub min_validator_stake: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_time: 5 * MILLIS_PER_SECOND,
            max_block_size: 512 * 1024,
            block_reward: 5_000,
            min_validator_stake: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Checkpoint every N blocks
    pub interval: u64,
    /// Blocks kept in the in-memory chain suffix
    pub keep_in_memory: usize,
    /// Most recent checkpoints retained on disk
    pub keep_on_disk: usize,
    pub csv_delimiter: char,
    /// Compress checkpoint bytes on disk with snappy
    pub compression: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 100,
            keep_in_memory: 256,
            keep_on_disk: 8,
            csv_delimiter: DEFAULT_CSV_DELIMITER,
            compression: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = NodeConfig::default();
        assert!(config.max_peers >= config.min_peers);
        assert!(config.checkpoint.keep_in_memory > 0);
        assert!(config.chain.max_block_size > 0);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"max_peers": 8, "chain": {"block_reward": 77}}"#).unwrap();
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.chain.block_reward, 77);
        assert_eq!(config.min_peers, NodeConfig::default().min_peers);
        assert_eq!(
            config.chain.block_time,
            ChainConfig::default().block_time
        );
    }
}
