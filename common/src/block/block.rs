use super::calculate_merkle_root;
use crate::{
    crypto::{Hash, Hashable, KeyPair, Signature},
    serializer::{Reader, ReaderError, Serializer, Writer},
    transaction::Transaction,
};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Error as FmtError, Formatter};
use std::sync::Arc;

use super::BlockHeader;

// Upper bound on transactions per block accepted off the wire
pub const MAX_TXS_PER_BLOCK: usize = u16::MAX as usize;

/// A full block: header, producer signature and the ordered transaction
/// list. Transactions are shared read-only once the block is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Validator signature over the header hash
    pub signature: Option<Signature>,
    pub transactions: Vec<Arc<Transaction>>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Arc<Transaction>>) -> Self {
        Self {
            header,
            signature: None,
            transactions,
        }
    }

    /// Block identity: the hash of the header
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn sign(&mut self, keypair: &KeyPair) {
        self.signature = Some(keypair.sign(self.hash().as_bytes()));
    }

    /// Check the producer signature against the validator address in the
    /// header.
    pub fn verify_signature(&self) -> bool {
        match &self.signature {
            Some(signature) => self
                .header
                .validator
                .verify(self.hash().as_bytes(), signature)
                .is_ok(),
            None => false,
        }
    }

    /// Recompute the merkle root from the transaction list and compare
    /// with the committed one.
    pub fn verify_merkle_root(&self) -> bool {
        calculate_merkle_root(&self.transactions) == self.header.merkle_root
    }

    /// Sum of the fees of all non-coinbase transactions
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.fee)
            .sum()
    }
}

impl Serializer for Block {
    fn write(&self, writer: &mut Writer) {
        self.header.write(writer);
        match &self.signature {
            Some(signature) => {
                writer.write_bool(true);
                signature.write(writer);
            }
            None => writer.write_bool(false),
        }
        writer.write_u16(&(self.transactions.len() as u16));
        for tx in &self.transactions {
            tx.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let header = BlockHeader::read(reader)?;
        let signature = if reader.read_bool()? {
            Some(Signature::read(reader)?)
        } else {
            None
        };
        let count = reader.read_u16()? as usize;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Arc::new(Transaction::read(reader)?));
        }

        Ok(Self {
            header,
            signature,
            transactions,
        })
    }

    fn size(&self) -> usize {
        self.header.size()
            + 1
            + self.signature.as_ref().map_or(0, |s| s.size())
            + 2
            + self.transactions.iter().map(|tx| tx.size()).sum::<usize>()
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "Block[height: {}, hash: {}, txs: {}]",
            self.header.height,
            self.hash(),
            self.transactions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::transaction::TransactionPayload;

    fn sample_block(keypair: &KeyPair) -> Block {
        let validator = keypair.public_key();
        let coinbase = Arc::new(Transaction::coinbase(validator, 1, 5000));
        let mut tx = Transaction::new(
            validator,
            KeyPair::generate().public_key(),
            100,
            5,
            1,
            TransactionPayload::Transfer,
        );
        tx.sign(keypair);
        let transactions = vec![coinbase, Arc::new(tx)];

        let header = BlockHeader::new(
            0,
            1,
            1_000,
            Hash::zero(),
            calculate_merkle_root(&transactions),
            validator,
            0,
        );
        Block::new(header, transactions)
    }

    #[test]
    fn test_wire_roundtrip() {
        let keypair = KeyPair::generate();
        let mut block = sample_block(&keypair);
        block.sign(&keypair);

        let bytes = block.to_bytes();
        let decoded = Block::from_bytes(&bytes).unwrap();
        assert_eq!(block, decoded);
        assert_eq!(block.hash(), decoded.hash());
        assert_eq!(block.size(), bytes.len());
    }

    #[test]
    fn test_signature_does_not_change_identity() {
        let keypair = KeyPair::generate();
        let mut block = sample_block(&keypair);
        let unsigned_hash = block.hash();
        block.sign(&keypair);
        assert_eq!(unsigned_hash, block.hash());
        assert!(block.verify_signature());
    }

    #[test]
    fn test_merkle_verification_detects_swap() {
        let keypair = KeyPair::generate();
        let mut block = sample_block(&keypair);
        assert!(block.verify_merkle_root());

        // Replace the body with an unrelated transaction
        let mut other = Transaction::new(
            keypair.public_key(),
            keypair.public_key(),
            999,
            1,
            2,
            TransactionPayload::Transfer,
        );
        other.sign(&keypair);
        block.transactions[1] = Arc::new(other);
        assert!(!block.verify_merkle_root());
    }

    #[test]
    fn test_total_fees_skips_coinbase() {
        let keypair = KeyPair::generate();
        let block = sample_block(&keypair);
        assert_eq!(block.total_fees(), 5);
    }
}
