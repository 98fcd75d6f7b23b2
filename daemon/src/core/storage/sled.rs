use super::{
    block_hash_key, block_height_key, checkpoint_key, BlockProvider, CheckpointProvider,
    MetadataProvider, Storage, CHECKPOINT_PREFIX, METADATA_CHAIN_HEIGHT, METADATA_GENESIS_HASH,
    METADATA_LAST_CHECKPOINT_HEIGHT,
};
use crate::core::error::BlockchainError;
use async_trait::async_trait;
use log::{debug, trace};
use std::path::Path;
use tessera_common::{
    block::Block,
    checkpoint::Checkpoint,
    crypto::Hash,
    serializer::Serializer,
};

// First byte of a stored checkpoint value: plain or snappy-compressed
const VALUE_PLAIN: u8 = 0;
const VALUE_COMPRESSED: u8 = 1;

/// Sled-backed storage. A single keyspace with path-style prefixes keeps
/// the on-disk layout stable and independent of the backend.
pub struct SledStorage {
    db: sled::Db,
    compress_checkpoints: bool,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>, compress_checkpoints: bool) -> Result<Self, BlockchainError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            compress_checkpoints,
        })
    }

    /// In-memory database, used by tests
    pub fn temporary() -> Result<Self, BlockchainError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            compress_checkpoints: false,
        })
    }

    fn encode_checkpoint(&self, checkpoint: &Checkpoint) -> Vec<u8> {
        let raw = checkpoint.to_bytes();
        if self.compress_checkpoints {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&raw)
                .unwrap_or_else(|_| raw.clone());
            if compressed.len() < raw.len() {
                let mut value = Vec::with_capacity(compressed.len() + 1);
                value.push(VALUE_COMPRESSED);
                value.extend_from_slice(&compressed);
                return value;
            }
        }
        let mut value = Vec::with_capacity(raw.len() + 1);
        value.push(VALUE_PLAIN);
        value.extend_from_slice(&raw);
        value
    }

    fn decode_checkpoint(value: &[u8]) -> Result<Checkpoint, BlockchainError> {
        let (flag, payload) = value
            .split_first()
            .ok_or(BlockchainError::CorruptedData("empty checkpoint value"))?;
        match *flag {
            VALUE_PLAIN => Ok(Checkpoint::from_bytes(payload)?),
            VALUE_COMPRESSED => {
                let raw = snap::raw::Decoder::new()
                    .decompress_vec(payload)
                    .map_err(|_| BlockchainError::CorruptedData("checkpoint decompression"))?;
                Ok(Checkpoint::from_bytes(&raw)?)
            }
            _ => Err(BlockchainError::CorruptedData("unknown checkpoint encoding")),
        }
    }
}

#[async_trait]
impl BlockProvider for SledStorage {
    async fn has_block(&self, hash: &Hash) -> Result<bool, BlockchainError> {
        Ok(self.db.contains_key(block_hash_key(hash))?)
    }

    async fn has_block_at_height(&self, height: u64) -> Result<bool, BlockchainError> {
        Ok(self.db.contains_key(block_height_key(height))?)
    }

    async fn save_block(&mut self, block: &Block) -> Result<(), BlockchainError> {
        let hash = block.hash();
        trace!("saving block {} at height {}", hash, block.height());
        self.db
            .insert(block_height_key(block.height()), block.to_bytes())?;
        self.db
            .insert(block_hash_key(&hash), block.height().to_be_bytes().to_vec())?;
        Ok(())
    }

    async fn get_block_at_height(&self, height: u64) -> Result<Option<Block>, BlockchainError> {
        match self.db.get(block_height_key(height))? {
            Some(bytes) => Ok(Some(Block::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_block_height_for_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<u64>, BlockchainError> {
        match self.db.get(block_hash_key(hash))? {
            Some(bytes) => {
                let array: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| BlockchainError::CorruptedData("block hash index"))?;
                Ok(Some(u64::from_be_bytes(array)))
            }
            None => Ok(None),
        }
    }

    async fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, BlockchainError> {
        let Some(height) = self.get_block_height_for_hash(hash).await? else {
            return Ok(None);
        };
        // The height entry may have been replaced by a reorg; make sure
        // it still holds the block we were asked for
        match self.get_block_at_height(height).await? {
            Some(block) if &block.hash() == hash => Ok(Some(block)),
            _ => Ok(None),
        }
    }

    async fn delete_block_hash_index(&mut self, hash: &Hash) -> Result<(), BlockchainError> {
        self.db.remove(block_hash_key(hash))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointProvider for SledStorage {
    async fn has_checkpoint_at_height(&self, height: u64) -> Result<bool, BlockchainError> {
        Ok(self.db.contains_key(checkpoint_key(height))?)
    }

    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), BlockchainError> {
        debug!("saving {}", checkpoint);
        let value = self.encode_checkpoint(checkpoint);
        self.db.insert(checkpoint_key(checkpoint.height), value)?;
        Ok(())
    }

    async fn get_checkpoint_at_height(
        &self,
        height: u64,
    ) -> Result<Option<Checkpoint>, BlockchainError> {
        match self.db.get(checkpoint_key(height))? {
            Some(bytes) => Ok(Some(Self::decode_checkpoint(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_checkpoint_heights(&self) -> Result<Vec<u64>, BlockchainError> {
        let mut heights = Vec::new();
        for entry in self.db.scan_prefix(CHECKPOINT_PREFIX) {
            let (key, _) = entry?;
            let suffix = &key[CHECKPOINT_PREFIX.len()..];
            let array: [u8; 8] = suffix
                .try_into()
                .map_err(|_| BlockchainError::CorruptedData("checkpoint key"))?;
            heights.push(u64::from_be_bytes(array));
        }
        // Big-endian keys scan in ascending height order already, but do
        // not rely on it
        heights.sort_unstable();
        Ok(heights)
    }

    async fn delete_checkpoint_at_height(&mut self, height: u64) -> Result<(), BlockchainError> {
        self.db.remove(checkpoint_key(height))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataProvider for SledStorage {
    async fn get_chain_height(&self) -> Result<Option<u64>, BlockchainError> {
        let Some(bytes) = self.db.get(METADATA_CHAIN_HEIGHT)? else {
            return Ok(None);
        };
        // Legacy deployments store decimal text; newer ones may store a
        // big-endian u64
        if let Ok(text) = std::str::from_utf8(&bytes) {
            if let Ok(height) = text.parse::<u64>() {
                return Ok(Some(height));
            }
        }
        let array: [u8; 8] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| BlockchainError::CorruptedData("chain height metadata"))?;
        Ok(Some(u64::from_be_bytes(array)))
    }

    async fn set_chain_height(&mut self, height: u64) -> Result<(), BlockchainError> {
        self.db
            .insert(METADATA_CHAIN_HEIGHT, height.to_string().as_bytes())?;
        Ok(())
    }

    async fn get_last_checkpoint_height(&self) -> Result<Option<u64>, BlockchainError> {
        match self.db.get(METADATA_LAST_CHECKPOINT_HEIGHT)? {
            Some(bytes) => {
                let array: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| BlockchainError::CorruptedData("last checkpoint metadata"))?;
                Ok(Some(u64::from_be_bytes(array)))
            }
            None => Ok(None),
        }
    }

    async fn set_last_checkpoint_height(&mut self, height: u64) -> Result<(), BlockchainError> {
        self.db
            .insert(METADATA_LAST_CHECKPOINT_HEIGHT, height.to_be_bytes().to_vec())?;
        Ok(())
    }

    async fn get_genesis_hash(&self) -> Result<Option<Hash>, BlockchainError> {
        match self.db.get(METADATA_GENESIS_HASH)? {
            Some(bytes) => {
                let array: [u8; 32] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| BlockchainError::CorruptedData("genesis hash metadata"))?;
                Ok(Some(Hash::new(array)))
            }
            None => Ok(None),
        }
    }

    async fn set_genesis_hash(&mut self, hash: &Hash) -> Result<(), BlockchainError> {
        self.db
            .insert(METADATA_GENESIS_HASH, hash.as_bytes().to_vec())?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn flush(&self) -> Result<(), BlockchainError> {
        self.db.flush()?;
        Ok(())
    }
}
