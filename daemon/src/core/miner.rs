use crate::core::{
    blockchain::Chain, checkpoint::CheckpointEngine, mempool::Mempool, storage::Storage,
};
use log::{debug, trace, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tessera_common::{
    block::{calculate_merkle_root, Block, BlockHeader},
    config::BLOCK_VERSION,
    crypto::{hash, Address, Hash},
    serializer::Serializer,
    time::get_current_time_in_millis,
    transaction::Transaction,
    wallet::Wallet,
};
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    time::interval,
};

/// Deterministic stake-weighted leader election.
///
/// The draw for `(tip, validator)` is the first eight bytes of
/// `hash(tip_hash || address)` reduced modulo the total stake; the
/// validator wins when its ticket lands inside its own stake. Every node
/// computes the same result for the same pair.
pub fn is_elected(tip_hash: &Hash, address: &Address, own_stake: u64, total_stake: u64) -> bool {
    if own_stake == 0 || total_stake == 0 {
        return false;
    }
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(tip_hash.as_bytes());
    bytes.extend_from_slice(address.as_bytes());
    let digest = hash(&bytes);
    let draw = u64::from_be_bytes(
        digest.as_bytes()[0..8]
            .try_into()
            .expect("hash is at least 8 bytes"),
    );
    draw % total_stake < own_stake
}

/// Periodic block production loop. Each tick runs a leader election and,
/// when elected, assembles, signs and emits a candidate block through the
/// injected sink. Persistence and broadcast are the sink consumer's job.
pub struct Miner<S: Storage> {
    wallet: Arc<Wallet>,
    chain: Arc<RwLock<Chain<S>>>,
    mempool: Arc<Mutex<Mempool>>,
    checkpoints: Arc<CheckpointEngine>,
    block_time: Duration,
    enabled: Arc<AtomicBool>,
    sink: mpsc::Sender<Block>,
}

impl<S: Storage> Miner<S> {
    pub fn new(
        wallet: Arc<Wallet>,
        chain: Arc<RwLock<Chain<S>>>,
        mempool: Arc<Mutex<Mempool>>,
        checkpoints: Arc<CheckpointEngine>,
        block_time: Duration,
        enabled: Arc<AtomicBool>,
        sink: mpsc::Sender<Block>,
    ) -> Self {
        Self {
            wallet,
            chain,
            mempool,
            checkpoints,
            block_time,
            enabled,
            sink,
        }
    }

    /// Run until the shutdown signal flips. An in-flight assembly always
    /// completes its tick; the signal is observed between ticks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.block_time);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.enabled.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Some(block) = self.try_produce().await {
                        if self.sink.send(block).await.is_err() {
                            warn!("block sink closed, stopping miner");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("miner received shutdown signal");
                    return;
                }
            }
        }
    }

    async fn try_produce(&self) -> Option<Block> {
        let address = self.wallet.address();

        // Lock order: chain before mempool
        let chain = self.chain.read().await;
        let own_stake = chain.state().get_stake(&address);
        let total_stake = chain.state().total_stake();
        if own_stake < chain.config().min_validator_stake {
            trace!("not eligible to mine: stake {} too low", own_stake);
            return None;
        }

        let tip_hash = chain.tip_hash().clone();
        if !is_elected(&tip_hash, &address, own_stake, total_stake) {
            trace!("not elected for tip {}", tip_hash);
            return None;
        }

        let height = chain.height() + 1;
        let parent_timestamp = chain.tip().header.timestamp;
        let max_block_size = chain.config().max_block_size;
        let block_reward = chain.config().block_reward;

        // Reserve room for the header and the coinbase before filling
        // the block from the mempool
        let reserved = 512;
        let mempool = self.mempool.lock().await;
        let selected =
            mempool.select_for_block(max_block_size.saturating_sub(reserved), chain.state());
        drop(mempool);

        let fees: u64 = selected.iter().map(|tx| tx.fee).sum();
        let mut transactions = vec![Arc::new(Transaction::coinbase(
            address,
            height,
            block_reward + fees,
        ))];
        transactions.extend(selected);

        let mut header = BlockHeader::new(
            BLOCK_VERSION,
            height,
            get_current_time_in_millis().max(parent_timestamp),
            tip_hash,
            calculate_merkle_root(&transactions),
            address,
            0,
        );
        if let Some((checkpoint_hash, checkpoint_height)) = self.checkpoints.last_tag().await {
            header.set_checkpoint(checkpoint_hash, checkpoint_height);
        }
        drop(chain);

        let mut block = Block::new(header, transactions);
        block.sign(self.wallet.keypair());
        debug!(
            "produced candidate {} ({} bytes)",
            block,
            block.size()
        );
        Some(block)
    }
}
