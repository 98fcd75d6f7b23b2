use crate::{
    config::ChainConfig,
    core::{
        checkpoint::CheckpointEngine,
        error::BlockchainError,
        state::StateAccumulator,
        storage::{BlockProvider, MetadataProvider, Storage},
    },
};
use log::{debug, info, warn};
use metrics::counter;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tessera_common::{
    block::{calculate_merkle_root, Block, BlockHeader},
    config::{BLOCK_VERSION, GENESIS_TIMESTAMP_MILLIS, MAX_TRANSACTION_SIZE},
    crypto::{Address, Hash},
    serializer::Serializer,
    transaction::Transaction,
};

/// Genesis allocation: one address starting with `amount`, fully staked,
/// so the network has an eligible validator from the first block on.
#[derive(Debug, Clone, Copy)]
pub struct GenesisConfig {
    pub address: Address,
    pub amount: u64,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            address: Address::zero(),
            amount: 0,
        }
    }
}

/// Build the deterministic genesis block for a given allocation. All
/// nodes of a network derive the identical block from the identical
/// configuration.
pub fn build_genesis_block(genesis: &GenesisConfig) -> Block {
    let coinbase = Arc::new(Transaction::coinbase(genesis.address, 0, genesis.amount));
    let transactions = vec![coinbase];
    let header = BlockHeader::new(
        BLOCK_VERSION,
        0,
        GENESIS_TIMESTAMP_MILLIS,
        Hash::zero(),
        calculate_merkle_root(&transactions),
        genesis.address,
        0,
    );
    Block::new(header, transactions)
}

/// Append-only ledger. Validates and applies blocks against the state
/// accumulator, keeps a bounded suffix of recent blocks in memory and
/// serves any older block from storage, by height.
pub struct Chain<S: Storage> {
    storage: S,
    config: ChainConfig,
    // bound of the in-memory suffix
    keep_in_memory: usize,
    // youngest blocks, oldest first; heights are contiguous and end at
    // the tip
    suffix: VecDeque<Arc<Block>>,
    // hash -> height for the in-memory suffix
    suffix_index: HashMap<Hash, u64>,
    state: StateAccumulator,
    tip_hash: Hash,
    height: u64,
}

impl<S: Storage> Chain<S> {
    /// Open the chain: load the persisted suffix and replay the state, or
    /// initialize a fresh store with the genesis block. A persisted
    /// genesis that does not match the configured one is fatal.
    pub async fn load(
        mut storage: S,
        config: ChainConfig,
        keep_in_memory: usize,
        genesis: GenesisConfig,
    ) -> Result<Self, BlockchainError> {
        let keep_in_memory = keep_in_memory.max(1);
        let genesis_block = build_genesis_block(&genesis);
        let genesis_hash = genesis_block.hash();

        let height = match storage.get_chain_height().await? {
            Some(height) => {
                match storage.get_genesis_hash().await? {
                    Some(stored) if stored == genesis_hash => {}
                    Some(_) => return Err(BlockchainError::GenesisMismatch),
                    None => return Err(BlockchainError::CorruptedData("missing genesis hash")),
                }
                height
            }
            None => {
                info!("fresh database, writing genesis block {}", genesis_hash);
                storage.save_block(&genesis_block).await?;
                storage.set_chain_height(0).await?;
                storage.set_genesis_hash(&genesis_hash).await?;
                storage.flush().await?;
                0
            }
        };

        let mut chain = Self {
            storage,
            config,
            keep_in_memory,
            suffix: VecDeque::new(),
            suffix_index: HashMap::new(),
            state: StateAccumulator::new(),
            tip_hash: genesis_hash,
            height,
        };

        chain.state = chain.replay_state_to(height).await?;
        chain.rebuild_suffix().await?;
        chain.tip_hash = chain
            .suffix
            .back()
            .map(|block| block.hash())
            .ok_or(BlockchainError::CorruptedData("empty chain after load"))?;

        info!(
            "chain loaded at height {} with tip {}",
            chain.height, chain.tip_hash
        );
        Ok(chain)
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn tip_hash(&self) -> &Hash {
        &self.tip_hash
    }

    /// The current tip; the suffix is never empty.
    pub fn tip(&self) -> Arc<Block> {
        self.suffix.back().cloned().expect("suffix holds the tip")
    }

    pub fn state(&self) -> &StateAccumulator {
        &self.state
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub async fn has_block(&self, hash: &Hash) -> Result<bool, BlockchainError> {
        if self.suffix_index.contains_key(hash) {
            return Ok(true);
        }
        self.storage.has_block(hash).await
    }

    /// Look a block up by height. Heights inside the in-memory suffix are
    /// served from memory, anything older transparently loads from
    /// storage.
    pub async fn get_block_at_height(
        &self,
        height: u64,
    ) -> Result<Option<Arc<Block>>, BlockchainError> {
        if height > self.height {
            return Ok(None);
        }
        let suffix_len = self.suffix.len() as u64;
        let suffix_start = self.height + 1 - suffix_len;
        if height >= suffix_start {
            return Ok(self.suffix.get((height - suffix_start) as usize).cloned());
        }
        Ok(self
            .storage
            .get_block_at_height(height)
            .await?
            .map(Arc::new))
    }

    pub async fn get_block_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<Arc<Block>>, BlockchainError> {
        if let Some(height) = self.suffix_index.get(hash) {
            return self.get_block_at_height(*height).await;
        }
        Ok(self.storage.get_block_by_hash(hash).await?.map(Arc::new))
    }

    /// Inclusive range of blocks. Always resolved by height, so the
    /// result is correct regardless of what has been pruned from memory;
    /// a hole in storage ends the range early rather than returning
    /// unrelated blocks.
    pub async fn range(&self, from: u64, to: u64) -> Result<Vec<Arc<Block>>, BlockchainError> {
        let mut blocks = Vec::new();
        if from > to {
            return Ok(blocks);
        }
        for height in from..=to.min(self.height) {
            match self.get_block_at_height(height).await? {
                Some(block) => blocks.push(block),
                None => {
                    warn!("missing block at height {} while serving a range", height);
                    break;
                }
            }
        }
        Ok(blocks)
    }

    /// Validate and apply a candidate block on top of the tip. Atomic:
    /// either the block becomes the new tip and the accumulator advances,
    /// or nothing changes.
    pub async fn apply_block(
        &mut self,
        block: Block,
        checkpoints: &CheckpointEngine,
    ) -> Result<Arc<Block>, BlockchainError> {
        let hash = block.hash();

        if self.has_block(&hash).await? {
            return Err(BlockchainError::DuplicateHash(hash));
        }

        if block.height() != self.height + 1 || block.header.previous_hash != self.tip_hash {
            return Err(BlockchainError::InvalidLinkage {
                height: block.height(),
                expected_height: self.height + 1,
                expected_parent: self.tip_hash.clone(),
            });
        }

        let parent_timestamp = self.tip().header.timestamp;
        if block.header.timestamp < parent_timestamp {
            return Err(BlockchainError::InvalidTimestamp {
                got: block.header.timestamp,
                parent: parent_timestamp,
            });
        }

        let size = block.size();
        if size > self.config.max_block_size {
            return Err(BlockchainError::BlockTooLarge {
                got: size,
                max: self.config.max_block_size,
            });
        }

        Self::validate_block_body(&block, &hash)?;

        // Validator eligibility in the accumulator as of the tip
        let stake = self.state.get_stake(&block.header.validator);
        if stake < self.config.min_validator_stake {
            return Err(BlockchainError::NotEligibleValidator(
                block.header.validator,
            ));
        }

        // Checkpoint lineage; mismatches are tolerated (see the engine)
        checkpoints
            .validate_block_tag(&block.header, &self.storage)
            .await?;

        // Tentative application on a shadow accumulator
        let mut shadow = self.state.clone();
        shadow.apply_block(&block, self.config.block_reward)?;

        self.commit_block(block, hash, shadow, checkpoints).await
    }

    // Stateless checks: merkle commitment, producer signature, per
    // transaction shape, size and signature
    fn validate_block_body(block: &Block, hash: &Hash) -> Result<(), BlockchainError> {
        if !block.verify_merkle_root() {
            return Err(BlockchainError::InvalidMerkleRoot(hash.clone()));
        }
        if !block.verify_signature() {
            return Err(BlockchainError::InvalidSignature(hash.clone()));
        }
        for tx in &block.transactions {
            if !tx.has_valid_shape() || tx.size() > MAX_TRANSACTION_SIZE {
                return Err(BlockchainError::InvalidTransaction(tx.hash()));
            }
            if !tx.verify_signature() {
                return Err(BlockchainError::InvalidSignature(tx.hash()));
            }
        }
        Ok(())
    }

    async fn commit_block(
        &mut self,
        block: Block,
        hash: Hash,
        state: StateAccumulator,
        checkpoints: &CheckpointEngine,
    ) -> Result<Arc<Block>, BlockchainError> {
        // Every storage write happens before the in-memory tip moves, so
        // a storage failure aborts the apply with the tip unchanged
        self.storage.save_block(&block).await?;
        self.storage.set_chain_height(block.height()).await?;
        checkpoints
            .on_block_applied(block.height(), &state, &mut self.storage)
            .await?;

        let block = Arc::new(block);
        self.height = block.height();
        self.tip_hash = hash.clone();
        self.state = state;
        self.suffix_index.insert(hash, self.height);
        self.suffix.push_back(block.clone());
        while self.suffix.len() > self.keep_in_memory {
            if let Some(old) = self.suffix.pop_front() {
                self.suffix_index.remove(&old.hash());
            }
        }

        counter!("tessera_blocks_applied").increment(1);
        debug!("applied {}", block);
        Ok(block)
    }

    /// Reconstruct the accumulator as of `height` by replaying stored
    /// blocks from genesis.
    pub async fn state_at_height(
        &self,
        height: u64,
    ) -> Result<StateAccumulator, BlockchainError> {
        if height == self.height {
            return Ok(self.state.clone());
        }
        if height > self.height {
            return Err(BlockchainError::BlockNotFoundAtHeight(height));
        }
        self.replay_state_to(height).await
    }

    async fn replay_state_to(&self, height: u64) -> Result<StateAccumulator, BlockchainError> {
        let mut state = StateAccumulator::new();
        for h in 0..=height {
            let block = self
                .storage
                .get_block_at_height(h)
                .await?
                .ok_or(BlockchainError::BlockNotFoundAtHeight(h))?;
            if h == 0 {
                state.apply_genesis(&block)?;
            } else {
                state.apply_block(&block, self.config.block_reward)?;
            }
        }
        Ok(state)
    }

    async fn rebuild_suffix(&mut self) -> Result<(), BlockchainError> {
        self.suffix.clear();
        self.suffix_index.clear();
        let start = self.height.saturating_sub(self.keep_in_memory as u64 - 1);
        for height in start..=self.height {
            let block = self
                .storage
                .get_block_at_height(height)
                .await?
                .ok_or(BlockchainError::BlockNotFoundAtHeight(height))?;
            let block = Arc::new(block);
            self.suffix_index.insert(block.hash(), height);
            self.suffix.push_back(block);
        }
        Ok(())
    }

    /// Apply a batch of blocks received through sync, in order. Blocks we
    /// already hold are skipped; the first failure aborts the batch. A
    /// linkage failure at or below our own height switches to fork
    /// evaluation with the remainder of the batch as the challenger.
    pub async fn process_sync_blocks(
        &mut self,
        blocks: Vec<Block>,
        checkpoints: &CheckpointEngine,
    ) -> Result<usize, BlockchainError> {
        let mut applied = 0;
        for (index, block) in blocks.iter().enumerate() {
            let hash = block.hash();
            if self.has_block(&hash).await? {
                continue;
            }
            match self.apply_block(block.clone(), checkpoints).await {
                Ok(_) => applied += 1,
                Err(BlockchainError::DuplicateHash(_)) => continue,
                Err(err @ BlockchainError::InvalidLinkage { .. })
                    if block.height() <= self.height =>
                {
                    let candidate: Vec<Block> = blocks[index..].to_vec();
                    if self.try_adopt_fork(candidate, checkpoints).await? {
                        return Ok(applied + blocks.len() - index);
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(applied)
    }

    /// Same-height fork resolution: the challenger suffix replaces ours
    /// only when it is strictly longer and the validator stake summed
    /// along it (measured in its own replayed lineage) is strictly
    /// greater than along the incumbent suffix.
    pub async fn try_adopt_fork(
        &mut self,
        blocks: Vec<Block>,
        checkpoints: &CheckpointEngine,
    ) -> Result<bool, BlockchainError> {
        let first = blocks
            .first()
            .ok_or(BlockchainError::ForkRejected("empty candidate"))?;
        if first.height() == 0 {
            return Err(BlockchainError::ForkRejected("cannot replace genesis"));
        }
        let ancestor_height = first.height() - 1;
        if ancestor_height > self.height {
            return Err(BlockchainError::ForkRejected("candidate does not attach"));
        }
        let ancestor = self
            .get_block_at_height(ancestor_height)
            .await?
            .ok_or(BlockchainError::BlockNotFoundAtHeight(ancestor_height))?;
        if ancestor.hash() != first.header.previous_hash {
            return Err(BlockchainError::ForkRejected("unknown common ancestor"));
        }

        let last_height = blocks.last().map(|b| b.height()).unwrap_or(0);
        if last_height <= self.height {
            debug!(
                "fork candidate ends at height {} which does not beat our {}",
                last_height, self.height
            );
            return Ok(false);
        }

        // Replay the challenger on a shadow state rooted at the ancestor,
        // validating every block and summing validator stake
        let mut shadow = self.state_at_height(ancestor_height).await?;
        let mut challenger_stake: u128 = 0;
        let mut prev_hash = ancestor.hash();
        let mut prev_timestamp = ancestor.header.timestamp;
        let mut expected_height = ancestor_height + 1;
        for block in &blocks {
            let hash = block.hash();
            if block.height() != expected_height || block.header.previous_hash != prev_hash {
                return Err(BlockchainError::ForkRejected("discontinuous candidate"));
            }
            if block.header.timestamp < prev_timestamp {
                return Err(BlockchainError::InvalidTimestamp {
                    got: block.header.timestamp,
                    parent: prev_timestamp,
                });
            }
            Self::validate_block_body(block, &hash)?;
            let stake = shadow.get_stake(&block.header.validator);
            if stake < self.config.min_validator_stake {
                return Err(BlockchainError::NotEligibleValidator(
                    block.header.validator,
                ));
            }
            challenger_stake += stake as u128;
            shadow.apply_block(block, self.config.block_reward)?;
            prev_hash = hash;
            prev_timestamp = block.header.timestamp;
            expected_height += 1;
        }

        // Stake along our own suffix from the same ancestor
        let mut incumbent_state = self.state_at_height(ancestor_height).await?;
        let mut incumbent_stake: u128 = 0;
        for height in (ancestor_height + 1)..=self.height {
            let block = self
                .get_block_at_height(height)
                .await?
                .ok_or(BlockchainError::BlockNotFoundAtHeight(height))?;
            incumbent_stake += incumbent_state.get_stake(&block.header.validator) as u128;
            incumbent_state.apply_block(&block, self.config.block_reward)?;
        }

        let challenger_len = last_height - ancestor_height;
        let incumbent_len = self.height - ancestor_height;
        if challenger_len <= incumbent_len || challenger_stake <= incumbent_stake {
            info!(
                "keeping incumbent chain: challenger len {} stake {} vs len {} stake {}",
                challenger_len, challenger_stake, incumbent_len, incumbent_stake
            );
            return Ok(false);
        }

        info!(
            "adopting fork from height {}: {} blocks with stake {} replace {} blocks with stake {}",
            ancestor_height + 1,
            challenger_len,
            challenger_stake,
            incumbent_len,
            incumbent_stake
        );

        // Drop the hash index entries of the replaced suffix
        for height in (ancestor_height + 1)..=self.height {
            if let Some(old) = self.storage.get_block_at_height(height).await? {
                self.storage.delete_block_hash_index(&old.hash()).await?;
            }
        }

        // Commit the challenger, re-running the checkpoint hook at every
        // height with the state as of that height
        let mut replay_state = self.state_at_height(ancestor_height).await?;
        for block in &blocks {
            self.storage.save_block(block).await?;
            if block.height() == 0 {
                replay_state.apply_genesis(block)?;
            } else {
                replay_state.apply_block(block, self.config.block_reward)?;
            }
            checkpoints
                .on_block_applied(block.height(), &replay_state, &mut self.storage)
                .await?;
        }

        self.height = last_height;
        self.tip_hash = prev_hash;
        self.state = shadow;
        self.storage.set_chain_height(self.height).await?;
        self.rebuild_suffix().await?;

        counter!("tessera_forks_adopted").increment(1);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointConfig;
    use crate::core::storage::{CheckpointProvider, SledStorage};
    use tessera_common::{time::get_current_time_in_millis, wallet::Wallet};

    fn chain_config() -> ChainConfig {
        ChainConfig {
            block_time: 1000,
            max_block_size: 64 * 1024,
            block_reward: 5_000,
            min_validator_stake: 1_000,
        }
    }

    fn engine() -> CheckpointEngine {
        engine_with_interval(10)
    }

    fn engine_with_interval(interval: u64) -> CheckpointEngine {
        CheckpointEngine::new(
            CheckpointConfig {
                enabled: true,
                interval,
                keep_in_memory: 4,
                keep_on_disk: 8,
                csv_delimiter: ',',
                compression: false,
            },
            Arc::new(Wallet::generate()),
        )
    }

    async fn fresh_chain(wallet: &Wallet, keep_in_memory: usize) -> Chain<SledStorage> {
        let storage = SledStorage::temporary().unwrap();
        Chain::load(
            storage,
            chain_config(),
            keep_in_memory,
            GenesisConfig {
                address: wallet.address(),
                amount: 1_000_000,
            },
        )
        .await
        .unwrap()
    }

    fn make_block(chain: &Chain<SledStorage>, wallet: &Wallet, txs: Vec<Arc<Transaction>>) -> Block {
        make_block_on(
            chain.height(),
            chain.tip_hash().clone(),
            chain.tip().header.timestamp,
            wallet,
            txs,
            chain.config().block_reward,
        )
    }

    fn make_block_on(
        parent_height: u64,
        parent_hash: Hash,
        parent_timestamp: u64,
        wallet: &Wallet,
        txs: Vec<Arc<Transaction>>,
        block_reward: u64,
    ) -> Block {
        let height = parent_height + 1;
        let fees: u64 = txs.iter().map(|tx| tx.fee).sum();
        let mut transactions = vec![Arc::new(Transaction::coinbase(
            wallet.address(),
            height,
            block_reward + fees,
        ))];
        transactions.extend(txs);

        let header = BlockHeader::new(
            BLOCK_VERSION,
            height,
            parent_timestamp.max(get_current_time_in_millis()),
            parent_hash,
            calculate_merkle_root(&transactions),
            wallet.address(),
            0,
        );
        let mut block = Block::new(header, transactions);
        block.sign(wallet.keypair());
        block
    }

    #[tokio::test]
    async fn test_fresh_chain_starts_at_genesis() {
        let wallet = Wallet::generate();
        let chain = fresh_chain(&wallet, 8).await;
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.state().get_balance(&wallet.address()), 1_000_000);
        assert_eq!(chain.state().get_stake(&wallet.address()), 1_000_000);
    }

    #[tokio::test]
    async fn test_apply_advances_tip_and_rejects_duplicates() {
        let wallet = Wallet::generate();
        let mut chain = fresh_chain(&wallet, 8).await;
        let checkpoints = engine();

        let block = make_block(&chain, &wallet, vec![]);
        let hash = block.hash();
        chain.apply_block(block.clone(), &checkpoints).await.unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip_hash(), &hash);

        // Applying the same block twice is a no-op error
        let height_before = chain.height();
        assert!(matches!(
            chain.apply_block(block, &checkpoints).await,
            Err(BlockchainError::DuplicateHash(_))
        ));
        assert_eq!(chain.height(), height_before);
    }

    #[tokio::test]
    async fn test_linkage_violations_are_rejected() {
        let wallet = Wallet::generate();
        let mut chain = fresh_chain(&wallet, 8).await;
        let checkpoints = engine();

        // Wrong parent hash
        let block = make_block_on(
            0,
            Hash::max(),
            GENESIS_TIMESTAMP_MILLIS,
            &wallet,
            vec![],
            chain.config().block_reward,
        );
        assert!(matches!(
            chain.apply_block(block, &checkpoints).await,
            Err(BlockchainError::InvalidLinkage { .. })
        ));

        // Wrong height
        let block = make_block_on(
            5,
            chain.tip_hash().clone(),
            GENESIS_TIMESTAMP_MILLIS,
            &wallet,
            vec![],
            chain.config().block_reward,
        );
        assert!(matches!(
            chain.apply_block(block, &checkpoints).await,
            Err(BlockchainError::InvalidLinkage { .. })
        ));
        assert_eq!(chain.height(), 0);
    }

    #[tokio::test]
    async fn test_unstaked_validator_is_rejected() {
        let wallet = Wallet::generate();
        let stranger = Wallet::generate();
        let mut chain = fresh_chain(&wallet, 8).await;
        let checkpoints = engine();

        let block = make_block(&chain, &stranger, vec![]);
        assert!(matches!(
            chain.apply_block(block, &checkpoints).await,
            Err(BlockchainError::NotEligibleValidator(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_coinbase_amount_is_rejected() {
        let wallet = Wallet::generate();
        let mut chain = fresh_chain(&wallet, 8).await;
        let checkpoints = engine();

        let mut block = make_block(&chain, &wallet, vec![]);
        // Overpay the producer and recommit merkle + signature so only
        // the state transition check can catch it
        let bad_coinbase = Arc::new(Transaction::coinbase(
            wallet.address(),
            1,
            chain.config().block_reward + 1,
        ));
        block.transactions[0] = bad_coinbase;
        block.header.merkle_root = calculate_merkle_root(&block.transactions);
        block.sign(wallet.keypair());

        assert!(matches!(
            chain.apply_block(block, &checkpoints).await,
            Err(BlockchainError::InvalidCoinbase(_))
        ));
    }

    #[tokio::test]
    async fn test_range_survives_pruning() {
        let wallet = Wallet::generate();
        // Tiny suffix: only 2 blocks stay in memory
        let mut chain = fresh_chain(&wallet, 2).await;
        let checkpoints = engine_with_interval(1000);

        let mut hashes = vec![chain.tip_hash().clone()];
        for _ in 0..6 {
            let block = make_block(&chain, &wallet, vec![]);
            hashes.push(block.hash());
            chain.apply_block(block, &checkpoints).await.unwrap();
        }
        assert_eq!(chain.height(), 6);
        assert_eq!(chain.suffix.len(), 2);

        // Heights below the suffix must still resolve to the right blocks
        let range = chain.range(1, 4).await.unwrap();
        assert_eq!(range.len(), 4);
        for (offset, block) in range.iter().enumerate() {
            let height = 1 + offset as u64;
            assert_eq!(block.height(), height);
            assert_eq!(block.hash(), hashes[height as usize]);
        }

        // Lookup by hash also works across the pruning boundary
        let block = chain.get_block_by_hash(&hashes[1]).await.unwrap().unwrap();
        assert_eq!(block.height(), 1);
    }

    #[tokio::test]
    async fn test_restart_replays_the_same_state() {
        let wallet = Wallet::generate();
        let storage = SledStorage::temporary().unwrap();
        let genesis = GenesisConfig {
            address: wallet.address(),
            amount: 1_000_000,
        };
        let checkpoints = engine();

        let mut chain = Chain::load(storage, chain_config(), 8, genesis)
            .await
            .unwrap();
        for _ in 0..5 {
            let block = make_block(&chain, &wallet, vec![]);
            chain.apply_block(block, &checkpoints).await.unwrap();
        }
        let tip = chain.tip_hash().clone();
        let balance = chain.state().get_balance(&wallet.address());
        assert_eq!(balance, 1_000_000 + 5 * chain.config().block_reward);

        // Re-open on the same storage
        let storage = chain.storage;
        let reloaded = Chain::load(storage, chain_config(), 8, genesis)
            .await
            .unwrap();
        assert_eq!(reloaded.height(), 5);
        assert_eq!(reloaded.tip_hash(), &tip);
        assert_eq!(reloaded.state().get_balance(&wallet.address()), balance);
        for height in 1..=5 {
            assert!(reloaded
                .get_block_at_height(height)
                .await
                .unwrap()
                .is_some());
        }
    }

    #[tokio::test]
    async fn test_genesis_mismatch_is_fatal() {
        let wallet = Wallet::generate();
        let chain = fresh_chain(&wallet, 8).await;
        let storage = chain.storage;

        let other = GenesisConfig {
            address: Wallet::generate().address(),
            amount: 42,
        };
        assert!(matches!(
            Chain::load(storage, chain_config(), 8, other).await,
            Err(BlockchainError::GenesisMismatch)
        ));
    }

    #[tokio::test]
    async fn test_fork_adoption_requires_length_and_stake() {
        // Two validators sharing a genesis: big holds more stake
        let big = Wallet::generate();
        let small = Wallet::generate();
        let storage = SledStorage::temporary().unwrap();
        let genesis = GenesisConfig {
            address: big.address(),
            amount: 150_000,
        };
        let checkpoints = engine_with_interval(1000);

        let mut chain = Chain::load(storage, chain_config(), 8, genesis)
            .await
            .unwrap();

        // Fund and stake the small validator through a mined block
        let fund = Arc::new({
            let mut tx = Transaction::new(
                big.address(),
                small.address(),
                0,
                0,
                1,
                tessera_common::transaction::TransactionPayload::Transfer,
            );
            tx.sign(big.keypair());
            tx
        });
        let block1 = make_block(&chain, &big, vec![fund]);
        chain.apply_block(block1, &checkpoints).await.unwrap();
        // Reward is spendable; stake it for the small validator
        let coinbase_to_small = make_block(&chain, &small, vec![]);
        // small has no stake yet, so this must fail
        assert!(matches!(
            chain
                .apply_block(coinbase_to_small, &checkpoints)
                .await,
            Err(BlockchainError::NotEligibleValidator(_))
        ));

        // Small chain continues with the big validator
        let block2 = make_block(&chain, &big, vec![]);
        let fork_parent_height = chain.height();
        let fork_parent_hash = chain.tip_hash().clone();
        let fork_parent_timestamp = chain.tip().header.timestamp;
        chain.apply_block(block2, &checkpoints).await.unwrap();
        assert_eq!(chain.height(), 2);

        // Challenger: strictly longer branch from height 1, same
        // validator so the stake along two blocks beats one block
        let fork_block_a = make_block_on(
            fork_parent_height,
            fork_parent_hash,
            fork_parent_timestamp,
            &big,
            vec![],
            chain.config().block_reward,
        );
        let fork_block_b = make_block_on(
            fork_block_a.height(),
            fork_block_a.hash(),
            fork_block_a.header.timestamp,
            &big,
            vec![],
            chain.config().block_reward,
        );
        let challenger_tip = fork_block_b.hash();

        let adopted = chain
            .try_adopt_fork(vec![fork_block_a, fork_block_b], &checkpoints)
            .await
            .unwrap();
        assert!(adopted);
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.tip_hash(), &challenger_tip);

        // Replay from storage agrees with the in-memory accumulator
        let replayed = chain.state_at_height(3).await.unwrap();
        assert_eq!(
            replayed.get_balance(&big.address()),
            chain.state().get_balance(&big.address())
        );
    }

    #[tokio::test]
    async fn test_equal_length_fork_is_kept_out() {
        let wallet = Wallet::generate();
        let mut chain = fresh_chain(&wallet, 8).await;
        let checkpoints = engine_with_interval(1000);

        let parent_hash = chain.tip_hash().clone();
        let parent_timestamp = chain.tip().header.timestamp;
        let block = make_block(&chain, &wallet, vec![]);
        chain.apply_block(block, &checkpoints).await.unwrap();

        // Same-height sibling, equal length: incumbent wins
        let sibling = make_block_on(
            0,
            parent_hash,
            parent_timestamp,
            &wallet,
            vec![],
            chain.config().block_reward,
        );
        let adopted = chain
            .try_adopt_fork(vec![sibling], &checkpoints)
            .await
            .unwrap();
        assert!(!adopted);
        assert_eq!(chain.height(), 1);
    }

    #[tokio::test]
    async fn test_checkpoints_created_while_mining() {
        let wallet = Wallet::generate();
        let mut chain = fresh_chain(&wallet, 4).await;
        let checkpoints = engine_with_interval(10);

        for _ in 0..25 {
            let block = make_block(&chain, &wallet, vec![]);
            chain.apply_block(block, &checkpoints).await.unwrap();
        }
        assert_eq!(chain.height(), 25);
        assert_eq!(
            chain
                .storage()
                .get_checkpoint_heights()
                .await
                .unwrap(),
            vec![10, 20]
        );
        // Suffix is bounded, storage still serves everything
        assert!(chain.suffix.len() <= 4);
        for height in 1..=25 {
            assert!(chain
                .get_block_at_height(height)
                .await
                .unwrap()
                .is_some());
        }
    }
}
