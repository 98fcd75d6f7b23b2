use crate::config::MAX_SYNC_BATCH;
use tessera_common::{
    block::Block,
    checkpoint::Checkpoint,
    config::{NETWORK_ID, NETWORK_ID_SIZE},
    crypto::Hash,
    serializer::{Reader, ReaderError, Serializer, Writer},
};

// Packet ids on the wire
const HANDSHAKE_ID: u8 = 0;
const BLOCK_PROPAGATION_ID: u8 = 1;
const TRANSACTION_PROPAGATION_ID: u8 = 2;
const SYNC_REQUEST_ID: u8 = 3;
const SYNC_RESPONSE_ID: u8 = 4;
const CHECKPOINT_REQUEST_ID: u8 = 5;
const CHECKPOINT_RESPONSE_ID: u8 = 6;

// Bounds applied while decoding untrusted payloads
const MAX_CHECKPOINTS_PER_RESPONSE: usize = 64;

/// First packet on every fresh connection, and repeated later as a
/// lightweight height announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub network_id: [u8; NETWORK_ID_SIZE],
    pub node_id: String,
    pub version: String,
    pub height: u64,
    pub tip_hash: Hash,
}

impl Handshake {
    pub fn new(node_id: String, version: String, height: u64, tip_hash: Hash) -> Self {
        Self {
            network_id: NETWORK_ID,
            node_id,
            version,
            height,
            tip_hash,
        }
    }
}

impl Serializer for Handshake {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.network_id);
        writer.write_string(&self.node_id);
        writer.write_string(&self.version);
        writer.write_u64(&self.height);
        writer.write_hash(&self.tip_hash);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let bytes = reader.read_bytes(NETWORK_ID_SIZE)?;
        let mut network_id = [0u8; NETWORK_ID_SIZE];
        network_id.copy_from_slice(&bytes);
        let node_id = reader.read_string()?;
        let version = reader.read_string()?;
        let height = reader.read_u64()?;
        let tip_hash = reader.read_hash()?;
        Ok(Self {
            network_id,
            node_id,
            version,
            height,
            tip_hash,
        })
    }
}

/// A block pushed through the gossip mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPropagation {
    /// Node id of the original producer, half of the gossip fingerprint
    pub origin: String,
    pub ttl: u8,
    pub hops: u8,
    pub block: Block,
}

impl Serializer for BlockPropagation {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.origin);
        writer.write_u8(self.ttl);
        writer.write_u8(self.hops);
        self.block.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            origin: reader.read_string()?,
            ttl: reader.read_u8()?,
            hops: reader.read_u8()?,
            block: Block::read(reader)?,
        })
    }
}

/// A transaction pushed through the gossip mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionPropagation {
    pub origin: String,
    pub ttl: u8,
    pub hops: u8,
    pub transaction: tessera_common::transaction::Transaction,
}

impl Serializer for TransactionPropagation {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(&self.origin);
        writer.write_u8(self.ttl);
        writer.write_u8(self.hops);
        self.transaction.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            origin: reader.read_string()?,
            ttl: reader.read_u8()?,
            hops: reader.read_u8()?,
            transaction: tessera_common::transaction::Transaction::read(reader)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub from_height: u64,
}

impl Serializer for SyncRequest {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.from_height);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            from_height: reader.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub blocks: Vec<Block>,
}

impl Serializer for SyncResponse {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(&(self.blocks.len() as u16));
        for block in &self.blocks {
            block.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let count = reader.read_u16()? as usize;
        if count > MAX_SYNC_BATCH {
            return Err(ReaderError::InvalidValue);
        }
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(Block::read(reader)?);
        }
        Ok(Self { blocks })
    }
}

/// `requested_height` of zero asks for the latest checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub requested_height: u64,
}

impl Serializer for CheckpointRequest {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(&self.requested_height);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            requested_height: reader.read_u64()?,
        })
    }
}

/// Bootstrap payload: the requested checkpoint, every other checkpoint
/// the server holds (so earlier block tags can be validated) and the
/// first batch of blocks to replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointResponse {
    pub checkpoint: Option<Checkpoint>,
    pub blocks_since: Vec<Block>,
    pub all_checkpoints: Vec<Checkpoint>,
}

impl Serializer for CheckpointResponse {
    fn write(&self, writer: &mut Writer) {
        match &self.checkpoint {
            Some(checkpoint) => {
                writer.write_bool(true);
                checkpoint.write(writer);
            }
            None => writer.write_bool(false),
        }
        writer.write_u16(&(self.blocks_since.len() as u16));
        for block in &self.blocks_since {
            block.write(writer);
        }
        writer.write_u16(&(self.all_checkpoints.len() as u16));
        for checkpoint in &self.all_checkpoints {
            checkpoint.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let checkpoint = if reader.read_bool()? {
            Some(Checkpoint::read(reader)?)
        } else {
            None
        };
        let block_count = reader.read_u16()? as usize;
        if block_count > MAX_SYNC_BATCH {
            return Err(ReaderError::InvalidValue);
        }
        let mut blocks_since = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            blocks_since.push(Block::read(reader)?);
        }
        let checkpoint_count = reader.read_u16()? as usize;
        if checkpoint_count > MAX_CHECKPOINTS_PER_RESPONSE {
            return Err(ReaderError::InvalidValue);
        }
        let mut all_checkpoints = Vec::with_capacity(checkpoint_count);
        for _ in 0..checkpoint_count {
            all_checkpoints.push(Checkpoint::read(reader)?);
        }
        Ok(Self {
            checkpoint,
            blocks_since,
            all_checkpoints,
        })
    }
}

/// Tagged union of everything that travels between peers. Unknown tags
/// surface as a decode error handled in the tolerant dispatch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(Handshake),
    BlockPropagation(BlockPropagation),
    TransactionPropagation(TransactionPropagation),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    CheckpointRequest(CheckpointRequest),
    CheckpointResponse(CheckpointResponse),
}

impl Packet {
    pub fn id(&self) -> u8 {
        match self {
            Packet::Handshake(_) => HANDSHAKE_ID,
            Packet::BlockPropagation(_) => BLOCK_PROPAGATION_ID,
            Packet::TransactionPropagation(_) => TRANSACTION_PROPAGATION_ID,
            Packet::SyncRequest(_) => SYNC_REQUEST_ID,
            Packet::SyncResponse(_) => SYNC_RESPONSE_ID,
            Packet::CheckpointRequest(_) => CHECKPOINT_REQUEST_ID,
            Packet::CheckpointResponse(_) => CHECKPOINT_RESPONSE_ID,
        }
    }

    /// Human readable packet kind for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Handshake(_) => "handshake",
            Packet::BlockPropagation(_) => "block",
            Packet::TransactionPropagation(_) => "transaction",
            Packet::SyncRequest(_) => "sync_request",
            Packet::SyncResponse(_) => "sync_response",
            Packet::CheckpointRequest(_) => "checkpoint_request",
            Packet::CheckpointResponse(_) => "checkpoint_response",
        }
    }
}

impl Serializer for Packet {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.id());
        match self {
            Packet::Handshake(inner) => inner.write(writer),
            Packet::BlockPropagation(inner) => inner.write(writer),
            Packet::TransactionPropagation(inner) => inner.write(writer),
            Packet::SyncRequest(inner) => inner.write(writer),
            Packet::SyncResponse(inner) => inner.write(writer),
            Packet::CheckpointRequest(inner) => inner.write(writer),
            Packet::CheckpointResponse(inner) => inner.write(writer),
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(match reader.read_u8()? {
            HANDSHAKE_ID => Packet::Handshake(Handshake::read(reader)?),
            BLOCK_PROPAGATION_ID => Packet::BlockPropagation(BlockPropagation::read(reader)?),
            TRANSACTION_PROPAGATION_ID => {
                Packet::TransactionPropagation(TransactionPropagation::read(reader)?)
            }
            SYNC_REQUEST_ID => Packet::SyncRequest(SyncRequest::read(reader)?),
            SYNC_RESPONSE_ID => Packet::SyncResponse(SyncResponse::read(reader)?),
            CHECKPOINT_REQUEST_ID => Packet::CheckpointRequest(CheckpointRequest::read(reader)?),
            CHECKPOINT_RESPONSE_ID => {
                Packet::CheckpointResponse(CheckpointResponse::read(reader)?)
            }
            _ => return Err(ReaderError::InvalidValue),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tessera_common::{
        block::{calculate_merkle_root, BlockHeader},
        crypto::KeyPair,
        transaction::{Transaction, TransactionPayload},
    };

    fn sample_block() -> Block {
        let keypair = KeyPair::generate();
        let validator = keypair.public_key();
        let coinbase = Arc::new(Transaction::coinbase(validator, 1, 5_000));
        let header = BlockHeader::new(
            0,
            1,
            1_000,
            Hash::zero(),
            calculate_merkle_root(&[coinbase.clone()]),
            validator,
            0,
        );
        let mut block = Block::new(header, vec![coinbase]);
        block.sign(&keypair);
        block
    }

    fn roundtrip(packet: Packet) {
        let bytes = packet.to_bytes();
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_handshake_roundtrip() {
        roundtrip(Packet::Handshake(Handshake::new(
            "node-1".into(),
            "0.1.0".into(),
            42,
            Hash::max(),
        )));
    }

    #[test]
    fn test_propagation_roundtrips() {
        roundtrip(Packet::BlockPropagation(BlockPropagation {
            origin: "node-1".into(),
            ttl: 8,
            hops: 2,
            block: sample_block(),
        }));

        let keypair = KeyPair::generate();
        let mut tx = Transaction::new(
            keypair.public_key(),
            keypair.public_key(),
            0,
            1,
            1,
            TransactionPayload::Stake { amount: 100 },
        );
        tx.sign(&keypair);
        roundtrip(Packet::TransactionPropagation(TransactionPropagation {
            origin: "node-2".into(),
            ttl: 1,
            hops: 7,
            transaction: tx,
        }));
    }

    #[test]
    fn test_sync_roundtrips() {
        roundtrip(Packet::SyncRequest(SyncRequest { from_height: 17 }));
        roundtrip(Packet::SyncResponse(SyncResponse {
            blocks: vec![sample_block(), sample_block()],
        }));
    }

    #[test]
    fn test_checkpoint_roundtrips() {
        roundtrip(Packet::CheckpointRequest(CheckpointRequest {
            requested_height: 0,
        }));

        let checkpoint = Checkpoint::create(10, 99, BTreeMap::new(), ',');
        roundtrip(Packet::CheckpointResponse(CheckpointResponse {
            checkpoint: Some(checkpoint.clone()),
            blocks_since: vec![sample_block()],
            all_checkpoints: vec![checkpoint],
        }));
        roundtrip(Packet::CheckpointResponse(CheckpointResponse {
            checkpoint: None,
            blocks_since: vec![],
            all_checkpoints: vec![],
        }));
    }

    #[test]
    fn test_unknown_packet_id_is_rejected() {
        let bytes = vec![42u8, 0, 0];
        assert!(Packet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_oversized_sync_response_is_rejected() {
        let mut writer = Writer::new();
        writer.write_u8(SYNC_RESPONSE_ID);
        writer.write_u16(&1_000);
        assert!(Packet::from_bytes(&writer.bytes()).is_err());
    }
}
