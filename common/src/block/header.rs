use crate::{
    crypto::{Address, Hash, Hashable},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampMillis,
};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Error as FmtError, Formatter};

/// Block header. The block hash is the hash over these canonical bytes;
/// the validator signature lives on the block, outside of the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u8,
    pub height: u64,
    pub timestamp: TimestampMillis,
    pub previous_hash: Hash,
    /// Merkle root over the ordered transaction id sequence
    pub merkle_root: Hash,
    pub validator: Address,
    pub nonce: u64,
    /// Identity of the last checkpoint known to the producer, if any.
    /// `checkpoint_height` is only meaningful when the hash is present.
    pub checkpoint_hash: Option<Hash>,
    pub checkpoint_height: u64,
}

impl BlockHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u8,
        height: u64,
        timestamp: TimestampMillis,
        previous_hash: Hash,
        merkle_root: Hash,
        validator: Address,
        nonce: u64,
    ) -> Self {
        Self {
            version,
            height,
            timestamp,
            previous_hash,
            merkle_root,
            validator,
            nonce,
            checkpoint_hash: None,
            checkpoint_height: 0,
        }
    }

    /// Embed the checkpoint reference. Must happen before hashing or
    /// signing the header.
    pub fn set_checkpoint(&mut self, hash: Hash, height: u64) {
        self.checkpoint_hash = Some(hash);
        self.checkpoint_height = height;
    }
}

impl Serializer for BlockHeader {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.version);
        writer.write_u64(&self.height);
        writer.write_u64(&self.timestamp);
        writer.write_hash(&self.previous_hash);
        writer.write_hash(&self.merkle_root);
        self.validator.write(writer);
        writer.write_u64(&self.nonce);
        match &self.checkpoint_hash {
            Some(hash) => {
                writer.write_bool(true);
                writer.write_hash(hash);
                writer.write_u64(&self.checkpoint_height);
            }
            None => writer.write_bool(false),
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let version = reader.read_u8()?;
        let height = reader.read_u64()?;
        let timestamp = reader.read_u64()?;
        let previous_hash = reader.read_hash()?;
        let merkle_root = reader.read_hash()?;
        let validator = Address::read(reader)?;
        let nonce = reader.read_u64()?;
        let (checkpoint_hash, checkpoint_height) = if reader.read_bool()? {
            (Some(reader.read_hash()?), reader.read_u64()?)
        } else {
            (None, 0)
        };

        Ok(Self {
            version,
            height,
            timestamp,
            previous_hash,
            merkle_root,
            validator,
            nonce,
            checkpoint_hash,
            checkpoint_height,
        })
    }

    fn size(&self) -> usize {
        1 + 8
            + 8
            + self.previous_hash.size()
            + self.merkle_root.size()
            + self.validator.size()
            + 8
            + 1
            + self
                .checkpoint_hash
                .as_ref()
                .map_or(0, |hash| hash.size() + 8)
    }
}

impl Hashable for BlockHeader {}

impl Display for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "BlockHeader[height: {}, previous: {}, validator: {}]",
            self.height, self.previous_hash, self.validator
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn header() -> BlockHeader {
        BlockHeader::new(
            0,
            5,
            1234,
            Hash::zero(),
            Hash::max(),
            KeyPair::generate().public_key(),
            7,
        )
    }

    #[test]
    fn test_roundtrip() {
        let h = header();
        let decoded = BlockHeader::from_bytes(&h.to_bytes()).unwrap();
        assert_eq!(h, decoded);
        assert_eq!(h.size(), h.to_bytes().len());
    }

    #[test]
    fn test_checkpoint_tag_changes_hash() {
        let mut h = header();
        let untagged = h.hash();
        h.set_checkpoint(Hash::max(), 10);
        assert_ne!(untagged, h.hash());

        let decoded = BlockHeader::from_bytes(&h.to_bytes()).unwrap();
        assert_eq!(h.hash(), decoded.hash());
        assert_eq!(decoded.checkpoint_height, 10);
    }
}
