mod sled;

pub use self::sled::SledStorage;

use crate::core::error::BlockchainError;
use async_trait::async_trait;
use tessera_common::{block::Block, checkpoint::Checkpoint, crypto::Hash};

// Stable key schema. The hash index stores the height of the block so a
// lookup by hash is key -> height -> block, never a second block copy.
pub(crate) const BLOCK_HEIGHT_PREFIX: &[u8] = b"block/height/";
pub(crate) const BLOCK_HASH_PREFIX: &[u8] = b"block/hash/";
pub(crate) const CHECKPOINT_PREFIX: &[u8] = b"checkpoint/";
pub(crate) const METADATA_CHAIN_HEIGHT: &[u8] = b"metadata/chain-height";
pub(crate) const METADATA_LAST_CHECKPOINT_HEIGHT: &[u8] = b"metadata/last-checkpoint-height";
pub(crate) const METADATA_GENESIS_HASH: &[u8] = b"metadata/genesis-hash";

pub(crate) fn block_height_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_HEIGHT_PREFIX.len() + 8);
    key.extend_from_slice(BLOCK_HEIGHT_PREFIX);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

pub(crate) fn block_hash_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_HASH_PREFIX.len() + 64);
    key.extend_from_slice(BLOCK_HASH_PREFIX);
    key.extend_from_slice(hash.to_hex().as_bytes());
    key
}

pub(crate) fn checkpoint_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(CHECKPOINT_PREFIX.len() + 8);
    key.extend_from_slice(CHECKPOINT_PREFIX);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Durable block access, indexed by height with a hash secondary index.
#[async_trait]
pub trait BlockProvider {
    async fn has_block(&self, hash: &Hash) -> Result<bool, BlockchainError>;

    async fn has_block_at_height(&self, height: u64) -> Result<bool, BlockchainError>;

    /// Store the block under its height and index its hash. Overwrites
    /// any block previously stored at the same height.
    async fn save_block(&mut self, block: &Block) -> Result<(), BlockchainError>;

    async fn get_block_at_height(&self, height: u64) -> Result<Option<Block>, BlockchainError>;

    async fn get_block_height_for_hash(&self, hash: &Hash)
        -> Result<Option<u64>, BlockchainError>;

    async fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, BlockchainError>;

    /// Drop the hash index entry of a block replaced during a reorg
    async fn delete_block_hash_index(&mut self, hash: &Hash) -> Result<(), BlockchainError>;
}

/// Durable checkpoint access.
#[async_trait]
pub trait CheckpointProvider {
    async fn has_checkpoint_at_height(&self, height: u64) -> Result<bool, BlockchainError>;

    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), BlockchainError>;

    async fn get_checkpoint_at_height(
        &self,
        height: u64,
    ) -> Result<Option<Checkpoint>, BlockchainError>;

    /// All stored checkpoint heights in ascending order
    async fn get_checkpoint_heights(&self) -> Result<Vec<u64>, BlockchainError>;

    async fn delete_checkpoint_at_height(&mut self, height: u64) -> Result<(), BlockchainError>;
}

/// Small single-key metadata entries.
#[async_trait]
pub trait MetadataProvider {
    /// Chain height. The value is decimal text for compatibility with
    /// earlier deployments; a big-endian u64 is accepted on read.
    async fn get_chain_height(&self) -> Result<Option<u64>, BlockchainError>;

    async fn set_chain_height(&mut self, height: u64) -> Result<(), BlockchainError>;

    async fn get_last_checkpoint_height(&self) -> Result<Option<u64>, BlockchainError>;

    async fn set_last_checkpoint_height(&mut self, height: u64) -> Result<(), BlockchainError>;

    async fn get_genesis_hash(&self) -> Result<Option<Hash>, BlockchainError>;

    async fn set_genesis_hash(&mut self, hash: &Hash) -> Result<(), BlockchainError>;
}

#[async_trait]
pub trait Storage:
    BlockProvider + CheckpointProvider + MetadataProvider + Send + Sync + 'static
{
    /// Block until all pending writes are durable
    async fn flush(&self) -> Result<(), BlockchainError>;
}
