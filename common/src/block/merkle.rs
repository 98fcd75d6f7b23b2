// Merkle root calculation for transaction lists

use crate::crypto::{hash, Hash};
use crate::transaction::Transaction;
use std::sync::Arc;

/// Calculate the merkle root over the ordered transaction id sequence.
///
/// Binary tree, parents are hash(left || right), an odd node pairs with
/// itself. This must match the header's merkle_root to prevent blocks
/// shipping a transaction body that does not belong to them.
pub fn calculate_merkle_root(transactions: &[Arc<Transaction>]) -> Hash {
    if transactions.is_empty() {
        return Hash::zero();
    }

    let mut hashes: Vec<Hash> = transactions.iter().map(|tx| tx.hash()).collect();

    if hashes.len() == 1 {
        return hash_pair(&hashes[0], &hashes[0]);
    }

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));
        for chunk in hashes.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next_level.push(hash_pair(left, right));
        }
        hashes = next_level;
    }

    hashes[0].clone()
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut bytes = Vec::with_capacity(left.as_bytes().len() * 2);
    bytes.extend_from_slice(left.as_bytes());
    bytes.extend_from_slice(right.as_bytes());
    hash(&bytes)
}
