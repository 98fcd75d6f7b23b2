//! Two-node convergence scenarios driven through the same chain entry
//! points the p2p handlers use: `range` on the serving side and
//! `process_sync_blocks` / `store_received_checkpoint` on the receiving
//! side.

use std::sync::Arc;
use tempdir::TempDir;
use tessera_common::{
    block::{calculate_merkle_root, Block, BlockHeader},
    config::BLOCK_VERSION,
    crypto::Hash,
    time::get_current_time_in_millis,
    transaction::{Transaction, TransactionPayload},
    wallet::Wallet,
};
use tessera_daemon::{
    config::{ChainConfig, CheckpointConfig},
    core::{
        blockchain::{Chain, GenesisConfig},
        checkpoint::CheckpointEngine,
        storage::{CheckpointProvider, SledStorage, Storage},
    },
};

const MAX_SYNC_BATCH: usize = 100;

fn chain_config() -> ChainConfig {
    ChainConfig {
        block_time: 1_000,
        max_block_size: 64 * 1024,
        block_reward: 5_000,
        min_validator_stake: 1_000,
    }
}

fn checkpoint_engine(interval: u64) -> CheckpointEngine {
    CheckpointEngine::new(
        CheckpointConfig {
            enabled: true,
            interval,
            keep_in_memory: 8,
            keep_on_disk: 8,
            csv_delimiter: ',',
            compression: false,
        },
        Arc::new(Wallet::generate()),
    )
}

async fn fresh_chain(genesis: GenesisConfig) -> Chain<SledStorage> {
    let storage = SledStorage::temporary().unwrap();
    Chain::load(storage, chain_config(), 8, genesis)
        .await
        .unwrap()
}

fn make_block_on(
    parent_height: u64,
    parent_hash: Hash,
    parent_timestamp: u64,
    wallet: &Wallet,
    txs: Vec<Arc<Transaction>>,
) -> Block {
    let height = parent_height + 1;
    let fees: u64 = txs.iter().map(|tx| tx.fee).sum();
    let mut transactions = vec![Arc::new(Transaction::coinbase(
        wallet.address(),
        height,
        chain_config().block_reward + fees,
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

async fn mine(
    chain: &mut Chain<SledStorage>,
    wallet: &Wallet,
    checkpoints: &CheckpointEngine,
    txs: Vec<Arc<Transaction>>,
) {
    let block = make_block_on(
        chain.height(),
        chain.tip_hash().clone(),
        chain.tip().header.timestamp,
        wallet,
        txs,
    );
    chain.apply_block(block, checkpoints).await.unwrap();
}

// One full range-sync round: the server answers from its chain, the
// client applies, until the client caught up
async fn range_sync(
    client: &mut Chain<SledStorage>,
    server: &Chain<SledStorage>,
    checkpoints: &CheckpointEngine,
) {
    while client.height() < server.height() {
        let from = client.height() + 1;
        let to = from + MAX_SYNC_BATCH as u64 - 1;
        let blocks: Vec<Block> = server
            .range(from, to)
            .await
            .unwrap()
            .iter()
            .map(|block| (**block).clone())
            .collect();
        if blocks.is_empty() {
            break;
        }
        client
            .process_sync_blocks(blocks, checkpoints)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_two_node_range_sync() {
    let wallet = Wallet::generate();
    let genesis = GenesisConfig {
        address: wallet.address(),
        amount: 1_000_000,
    };
    let checkpoints_a = checkpoint_engine(1_000);
    let checkpoints_b = checkpoint_engine(1_000);

    // Node A mines to height 10 in isolation
    let mut node_a = fresh_chain(genesis).await;
    for _ in 0..10 {
        mine(&mut node_a, &wallet, &checkpoints_a, vec![]).await;
    }

    // Node B connects and pulls the range
    let mut node_b = fresh_chain(genesis).await;
    range_sync(&mut node_b, &node_a, &checkpoints_b).await;

    assert_eq!(node_b.height(), 10);
    assert_eq!(node_b.tip_hash(), node_a.tip_hash());
    // Replayed state matches
    assert_eq!(
        node_b.state().get_balance(&wallet.address()),
        node_a.state().get_balance(&wallet.address())
    );
}

#[tokio::test]
async fn test_sync_response_contract_starts_exactly_at_from() {
    let wallet = Wallet::generate();
    let genesis = GenesisConfig {
        address: wallet.address(),
        amount: 1_000_000,
    };
    let checkpoints = checkpoint_engine(1_000);
    let mut chain = fresh_chain(genesis).await;
    for _ in 0..12 {
        mine(&mut chain, &wallet, &checkpoints, vec![]).await;
    }

    let blocks = chain.range(4, 9).await.unwrap();
    assert_eq!(blocks.len(), 6);
    let mut expected = 4;
    for block in blocks {
        assert_eq!(block.height(), expected);
        expected += 1;
    }

    // Beyond the tip, the range is clamped rather than padded
    let blocks = chain.range(10, 200).await.unwrap();
    assert_eq!(blocks.first().unwrap().height(), 10);
    assert_eq!(blocks.last().unwrap().height(), 12);
}

#[tokio::test]
async fn test_sync_batches_span_pruned_history() {
    let wallet = Wallet::generate();
    let genesis = GenesisConfig {
        address: wallet.address(),
        amount: 1_000_000,
    };
    let checkpoints = checkpoint_engine(1_000);

    // Server keeps almost nothing in memory
    let storage = SledStorage::temporary().unwrap();
    let mut server = Chain::load(storage, chain_config(), 2, genesis)
        .await
        .unwrap();
    for _ in 0..30 {
        mine(&mut server, &wallet, &checkpoints, vec![]).await;
    }

    let mut client = fresh_chain(genesis).await;
    let client_checkpoints = checkpoint_engine(1_000);
    range_sync(&mut client, &server, &client_checkpoints).await;
    assert_eq!(client.height(), 30);
    assert_eq!(client.tip_hash(), server.tip_hash());
}

#[tokio::test]
async fn test_stake_weighted_fork_resolution() {
    // Two validators: the genesis holder with a large stake and a second
    // one staked through on-chain transactions
    let big = Wallet::generate();
    let small = Wallet::generate();
    let genesis = GenesisConfig {
        address: big.address(),
        amount: 1_000_000,
    };
    let checkpoints = checkpoint_engine(1_000);

    let mut node_a = fresh_chain(genesis).await;

    // Height 1: reward makes the big wallet liquid
    mine(&mut node_a, &big, &checkpoints, vec![]).await;
    // Height 2: fund the small validator
    let fund = {
        let mut tx = Transaction::new(
            big.address(),
            small.address(),
            3_000,
            0,
            1,
            TransactionPayload::Transfer,
        );
        tx.sign(big.keypair());
        Arc::new(tx)
    };
    mine(&mut node_a, &big, &checkpoints, vec![fund]).await;
    // Height 3: the small validator stakes
    let stake = Arc::new(small.create_stake_transaction(2_000, 0, 1));
    mine(&mut node_a, &big, &checkpoints, vec![stake]).await;

    // Node B replicates the common prefix
    let mut node_b = fresh_chain(genesis).await;
    let checkpoints_b = checkpoint_engine(1_000);
    range_sync(&mut node_b, &node_a, &checkpoints_b).await;
    assert_eq!(node_b.tip_hash(), node_a.tip_hash());

    // Partition: A extends with the heavy validator twice, B once with
    // the light one
    mine(&mut node_a, &big, &checkpoints, vec![]).await;
    mine(&mut node_a, &big, &checkpoints, vec![]).await;
    mine(&mut node_b, &small, &checkpoints_b, vec![]).await;
    assert_ne!(node_a.tip_hash(), node_b.tip_hash());

    // Keep B's branch tip around before it gets replaced
    let light_block = (*node_b.get_block_at_height(4).await.unwrap().unwrap()).clone();

    // Reconnect: B receives A's suffix from the divergence point and
    // adopts it (strictly longer, strictly more stake along the suffix)
    let blocks: Vec<Block> = node_a
        .range(4, node_a.height())
        .await
        .unwrap()
        .iter()
        .map(|block| (**block).clone())
        .collect();
    node_b
        .process_sync_blocks(blocks, &checkpoints_b)
        .await
        .unwrap();
    assert_eq!(node_b.height(), node_a.height());
    assert_eq!(node_b.tip_hash(), node_a.tip_hash());

    // The reverse direction must not win: the light branch is shorter,
    // so A rejects it and keeps its own chain
    let tip_before = node_a.tip_hash().clone();
    assert!(node_a
        .process_sync_blocks(vec![light_block], &checkpoints)
        .await
        .is_err());
    assert_eq!(node_a.height(), 5);
    assert_eq!(node_a.tip_hash(), &tip_before);
}

#[tokio::test]
async fn test_checkpoint_bootstrap() {
    let wallet = Wallet::generate();
    let genesis = GenesisConfig {
        address: wallet.address(),
        amount: 1_000_000,
    };
    let server_checkpoints = checkpoint_engine(10);

    let mut server = fresh_chain(genesis).await;
    for _ in 0..25 {
        mine(&mut server, &wallet, &server_checkpoints, vec![]).await;
    }
    assert_eq!(
        server.storage().get_checkpoint_heights().await.unwrap(),
        vec![10, 20]
    );

    // Build the bootstrap payload the way the checkpoint_request handler
    // does: latest checkpoint, all older ones, blocks from height 1
    let heights = server.storage().get_checkpoint_heights().await.unwrap();
    let latest = *heights.last().unwrap();
    let mut checkpoints = Vec::new();
    for height in heights {
        checkpoints.push(
            server
                .storage()
                .get_checkpoint_at_height(height)
                .await
                .unwrap()
                .unwrap(),
        );
    }
    let blocks: Vec<Block> = server
        .range(1, (MAX_SYNC_BATCH as u64).min(server.height()))
        .await
        .unwrap()
        .iter()
        .map(|block| (**block).clone())
        .collect();

    // Client: validate and persist the checkpoints, then replay blocks
    let mut client = fresh_chain(genesis).await;
    let client_checkpoints = checkpoint_engine(10);
    for checkpoint in checkpoints {
        client_checkpoints
            .store_received_checkpoint(checkpoint, client.storage_mut())
            .await
            .unwrap();
    }
    assert_eq!(
        client_checkpoints.last_tag().await.map(|(_, h)| h),
        Some(latest)
    );

    client
        .process_sync_blocks(blocks, &client_checkpoints)
        .await
        .unwrap();
    assert_eq!(client.height(), 25);
    assert_eq!(client.tip_hash(), server.tip_hash());
    assert_eq!(
        client.storage().get_checkpoint_heights().await.unwrap(),
        vec![10, 20]
    );
}

#[tokio::test]
async fn test_persistence_across_restart() {
    let dir = TempDir::new("tessera-restart").unwrap();
    let db_path = dir.path().join("db");
    let wallet = Wallet::generate();
    let genesis = GenesisConfig {
        address: wallet.address(),
        amount: 1_000_000,
    };
    let checkpoints = checkpoint_engine(1_000);

    let mut hashes = Vec::new();
    {
        let storage = SledStorage::open(&db_path, false).unwrap();
        let mut chain = Chain::load(storage, chain_config(), 8, genesis)
            .await
            .unwrap();
        for _ in 0..5 {
            mine(&mut chain, &wallet, &checkpoints, vec![]).await;
            hashes.push(chain.tip_hash().clone());
        }
        chain.storage().flush().await.unwrap();
    }

    // Reopen the same database: height, state and every block must be
    // back, with identical hashes
    let storage = SledStorage::open(&db_path, false).unwrap();
    let chain = Chain::load(storage, chain_config(), 8, genesis)
        .await
        .unwrap();
    assert_eq!(chain.height(), 5);
    assert_eq!(
        chain.state().get_balance(&wallet.address()),
        1_000_000 + 5 * chain_config().block_reward
    );
    for (index, expected) in hashes.iter().enumerate() {
        let block = chain
            .get_block_at_height(index as u64 + 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&block.hash(), expected);
    }
}
