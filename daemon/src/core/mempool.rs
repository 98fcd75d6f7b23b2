use crate::core::state::StateAccumulator;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_common::{
    config::MAX_TRANSACTION_SIZE,
    crypto::{Address, Hash},
    serializer::Serializer,
    time::{get_current_time_in_millis, TimestampMillis},
    transaction::{Transaction, TransactionPayload},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("Transaction already in the mempool")]
    DuplicateId,

    #[error("Invalid transaction signature")]
    BadSignature,

    #[error("Malformed transaction")]
    InvalidShape,

    #[error("Transaction exceeds the maximum size")]
    TooLarge,

    #[error("Invalid nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Mempool is full")]
    Full,
}

struct MempoolEntry {
    tx: Arc<Transaction>,
    arrival: TimestampMillis,
    // insertion counter, tie-breaker for identical arrival timestamps
    seq: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SenderInfo {
    // sum of spendable outflows of all pending transactions
    pending_spend: u64,
    highest_nonce: u64,
    count: usize,
}

/// Pool of validated transactions waiting for inclusion, deduplicated by
/// transaction id and ordered by fee for block assembly.
pub struct Mempool {
    txs: HashMap<Hash, MempoolEntry>,
    senders: HashMap<Address, SenderInfo>,
    capacity: usize,
    next_seq: u64,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            txs: HashMap::new(),
            senders: HashMap::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.txs.len()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.txs.contains_key(id)
    }

    /// Next usable nonce for a sender, counting pending transactions
    pub fn next_nonce(&self, address: &Address, state: &StateAccumulator) -> u64 {
        match self.senders.get(address) {
            Some(info) if info.count > 0 => info.highest_nonce + 1,
            _ => state.get_nonce(address) + 1,
        }
    }

    // Spendable amount a transaction takes away from its sender while it
    // is pending: transfers spend amount + fee, staking locks the delta
    // on top of the fee, unstaking only spends the fee
    fn outflow(tx: &Transaction) -> u64 {
        match tx.payload {
            TransactionPayload::Transfer => tx.amount.saturating_add(tx.fee),
            TransactionPayload::Stake { amount } => amount.saturating_add(tx.fee),
            TransactionPayload::Unstake { .. } => tx.fee,
            TransactionPayload::Coinbase => 0,
        }
    }

    pub fn insert(
        &mut self,
        tx: Arc<Transaction>,
        state: &StateAccumulator,
    ) -> Result<Hash, MempoolError> {
        if tx.is_coinbase() || !tx.has_valid_shape() {
            return Err(MempoolError::InvalidShape);
        }
        if tx.size() > MAX_TRANSACTION_SIZE {
            return Err(MempoolError::TooLarge);
        }

        let id = tx.hash();
        if self.txs.contains_key(&id) {
            return Err(MempoolError::DuplicateId);
        }

        if !tx.verify_signature() {
            return Err(MempoolError::BadSignature);
        }

        let from = tx.from.ok_or(MempoolError::InvalidShape)?;
        let info = self.senders.get(&from).copied().unwrap_or_default();

        // Reject-on-gap: the only accepted nonce is the next one after
        // everything already pending (or applied) from this sender
        let expected = if info.count > 0 {
            info.highest_nonce + 1
        } else {
            state.get_nonce(&from) + 1
        };
        if tx.nonce != expected {
            return Err(MempoolError::BadNonce {
                expected,
                got: tx.nonce,
            });
        }

        // Projected balance: what the account can still spend once all
        // pending transactions of this sender went through
        let outflow = Self::outflow(&tx);
        let available = state.get_spendable(&from).saturating_sub(info.pending_spend);
        if available < outflow {
            return Err(MempoolError::InsufficientBalance {
                required: outflow,
                available,
            });
        }

        if self.txs.len() >= self.capacity {
            self.evict_for(&tx)?;
        }

        let entry = self.senders.entry(from).or_default();
        entry.pending_spend = entry.pending_spend.saturating_add(outflow);
        entry.highest_nonce = tx.nonce;
        entry.count += 1;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.txs.insert(
            id.clone(),
            MempoolEntry {
                tx,
                arrival: get_current_time_in_millis(),
                seq,
            },
        );
        Ok(id)
    }

    // Capacity overflow: drop the cheapest pending transaction, but only
    // if the newcomer pays a strictly higher fee
    fn evict_for(&mut self, tx: &Transaction) -> Result<(), MempoolError> {
        let victim = self
            .txs
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.tx.fee
                    .cmp(&b.tx.fee)
                    .then_with(|| b.arrival.cmp(&a.arrival))
            })
            .map(|(id, entry)| (id.clone(), entry.tx.fee));

        match victim {
            Some((id, fee)) if fee < tx.fee => {
                debug!("mempool full, evicting {} (fee {})", id, fee);
                self.remove_entry(&id);
                Ok(())
            }
            _ => Err(MempoolError::Full),
        }
    }

    fn remove_entry(&mut self, id: &Hash) {
        if let Some(entry) = self.txs.remove(id) {
            if let Some(from) = entry.tx.from {
                if let Some(info) = self.senders.get_mut(&from) {
                    info.pending_spend =
                        info.pending_spend.saturating_sub(Self::outflow(&entry.tx));
                    info.count -= 1;
                    if info.count == 0 {
                        self.senders.remove(&from);
                    }
                }
            }
        }
    }

    /// Drop the given transactions, typically after they landed in an
    /// applied block. Unknown ids are ignored.
    pub fn remove_many<'a>(&mut self, ids: impl IntoIterator<Item = &'a Hash>) {
        for id in ids {
            self.remove_entry(id);
        }
    }

    /// Pick transactions for a block: fee descending, then arrival order.
    /// Senders are tracked while picking so a selected set can never
    /// invalidate itself, and the cumulative encoded size stays within
    /// `max_bytes`.
    pub fn select_for_block(
        &self,
        max_bytes: usize,
        state: &StateAccumulator,
    ) -> Vec<Arc<Transaction>> {
        let mut ordered: Vec<&MempoolEntry> = self.txs.values().collect();
        ordered.sort_by(|a, b| {
            b.tx.fee
                .cmp(&a.tx.fee)
                .then_with(|| a.arrival.cmp(&b.arrival))
                .then_with(|| a.seq.cmp(&b.seq))
        });

        let mut selected = Vec::new();
        let mut used_bytes = 0usize;
        // Projected per-sender view as transactions are greedily included
        let mut projected: HashMap<Address, (u64, u64)> = HashMap::new(); // (spendable, nonce)

        for entry in ordered {
            let tx = &entry.tx;
            let Some(from) = tx.from else { continue };

            let tx_size = tx.size();
            if used_bytes + tx_size > max_bytes {
                continue;
            }

            let (spendable, nonce) = projected
                .get(&from)
                .copied()
                .unwrap_or_else(|| (state.get_spendable(&from), state.get_nonce(&from)));

            if tx.nonce != nonce + 1 {
                continue;
            }
            let outflow = Self::outflow(tx);
            if spendable < outflow {
                continue;
            }

            projected.insert(from, (spendable - outflow, tx.nonce));
            used_bytes += tx_size;
            selected.push(entry.tx.clone());
        }

        selected
    }
}
