use crate::{
    config::{NodeConfig, MEMPOOL_CAPACITY},
    core::{
        blockchain::{Chain, GenesisConfig},
        checkpoint::CheckpointEngine,
        error::BlockchainError,
        mempool::{Mempool, MempoolError},
        miner::Miner,
        storage::Storage,
    },
    p2p::{error::P2pError, P2pServer},
};
use log::{debug, error, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tessera_common::{
    block::Block,
    crypto::{Address, Hash, PublicKey},
    transaction::TransactionPayload,
    wallet::Wallet,
};
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};

// Capacity of the miner -> runtime block channel
const BLOCK_SINK_CAPACITY: usize = 16;

/// The running node: owns the chain, mempool, checkpoint engine, miner
/// and p2p server, and is the only public surface of the daemon.
pub struct NodeRuntime<S: Storage> {
    config: NodeConfig,
    wallet: Arc<Wallet>,
    chain: Arc<RwLock<Chain<S>>>,
    mempool: Arc<Mutex<Mempool>>,
    checkpoints: Arc<CheckpointEngine>,
    p2p: Arc<P2pServer<S>>,
    mining: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<S: Storage> NodeRuntime<S> {
    /// Open the chain on the given storage and wire all subsystems
    /// together. Fails on storage errors and on a genesis mismatch; both
    /// are unrecoverable at startup.
    pub async fn new(
        config: NodeConfig,
        storage: S,
        wallet: Wallet,
    ) -> Result<Arc<Self>, BlockchainError> {
        let wallet = Arc::new(wallet);

        let genesis = match &config.initial_stake_address {
            Some(hex) => GenesisConfig {
                address: PublicKey::from_hex(hex)
                    .map_err(|_| BlockchainError::CorruptedData("invalid initial stake address"))?,
                amount: config.initial_stake_amount,
            },
            None => GenesisConfig::default(),
        };

        let chain = Chain::load(
            storage,
            config.chain.clone(),
            config.checkpoint.keep_in_memory,
            genesis,
        )
        .await?;

        let checkpoints = Arc::new(CheckpointEngine::new(
            config.checkpoint.clone(),
            Arc::clone(&wallet),
        ));
        checkpoints.load_from_storage(chain.storage()).await?;

        let chain = Arc::new(RwLock::new(chain));
        let mempool = Arc::new(Mutex::new(Mempool::new(MEMPOOL_CAPACITY)));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let node_id = config
            .id
            .clone()
            .unwrap_or_else(|| wallet.address().to_hex());
        if let Some(signaling) = &config.signaling_server {
            // Connection brokering itself happens outside of the daemon
            info!("discovery collaborator configured at {}", signaling);
        }

        let p2p = P2pServer::new(
            node_id,
            config.bind_address,
            config.max_peers,
            config.min_peers,
            config.priority_peers.clone(),
            Duration::from_secs(config.discovery_interval_seconds.max(1)),
            Arc::clone(&chain),
            Arc::clone(&mempool),
            Arc::clone(&checkpoints),
            shutdown_rx,
        );

        Ok(Arc::new(Self {
            config,
            wallet,
            chain,
            mempool,
            checkpoints,
            p2p,
            mining: Arc::new(AtomicBool::new(false)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Start the p2p loops, the miner loop (idle until `start_mining`)
    /// and the block sink that persists and broadcasts produced blocks.
    pub async fn start(self: &Arc<Self>) -> Result<(), P2pError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("starting node {}", self.p2p.get_node_id());

        let mut tasks = self.p2p.start().await?;

        let (block_tx, block_rx) = mpsc::channel(BLOCK_SINK_CAPACITY);
        let miner = Miner::new(
            Arc::clone(&self.wallet),
            Arc::clone(&self.chain),
            Arc::clone(&self.mempool),
            Arc::clone(&self.checkpoints),
            Duration::from_millis(self.config.chain.block_time.max(1)),
            Arc::clone(&self.mining),
            block_tx,
        );
        tasks.push(tokio::spawn(miner.run(self.shutdown.subscribe())));
        tasks.push(tokio::spawn(
            Arc::clone(self).block_sink_loop(block_rx),
        ));

        self.tasks.lock().await.extend(tasks);
        Ok(())
    }

    // Consumes blocks emitted by the miner: apply to our own chain, then
    // broadcast. Errors are logged and the loop continues.
    async fn block_sink_loop(self: Arc<Self>, mut block_rx: mpsc::Receiver<Block>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                block = block_rx.recv() => {
                    let Some(block) = block else { return };
                    let result = {
                        let mut chain = self.chain.write().await;
                        chain.apply_block(block.clone(), &self.checkpoints).await
                    };
                    match result {
                        Ok(applied) => {
                            info!("mined {}", applied);
                            let ids: Vec<Hash> = applied
                                .transactions
                                .iter()
                                .filter(|tx| !tx.is_coinbase())
                                .map(|tx| tx.hash())
                                .collect();
                            if !ids.is_empty() {
                                self.mempool.lock().await.remove_many(ids.iter());
                            }
                            self.p2p.broadcast_block(&block).await;
                        }
                        Err(e) => {
                            // Usually a race with a propagated block at
                            // the same height; the next tick re-elects
                            warn!("could not apply own mined block: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Stop every loop and flush storage. Idempotent; all background
    /// tasks have terminated when this returns.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("node already stopped");
            return;
        }
        info!("stopping node");
        self.mining.store(false, Ordering::SeqCst);
        if self.shutdown.send(true).is_err() {
            debug!("no shutdown listeners left");
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("task ended abnormally during shutdown: {}", e);
            }
        }
        self.p2p.stop().await;

        if let Err(e) = self.chain.read().await.storage().flush().await {
            error!("failed to flush storage on shutdown: {}", e);
        }
        info!("node stopped");
    }

    pub fn start_mining(&self) {
        info!("mining enabled");
        self.mining.store(true, Ordering::SeqCst);
    }

    pub fn stop_mining(&self) {
        info!("mining disabled");
        self.mining.store(false, Ordering::SeqCst);
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn chain(&self) -> &Arc<RwLock<Chain<S>>> {
        &self.chain
    }

    pub fn p2p(&self) -> &Arc<P2pServer<S>> {
        &self.p2p
    }

    /// Build, sign, insert and broadcast a transaction from the node
    /// wallet. The nonce is derived from the account state plus whatever
    /// is already pending.
    pub async fn create_transaction(
        &self,
        to: Address,
        amount: u64,
        fee: u64,
        payload: TransactionPayload,
    ) -> Result<Hash, MempoolError> {
        let transaction = {
            // Lock order: chain before mempool
            let chain = self.chain.read().await;
            let mut mempool = self.mempool.lock().await;
            let nonce = mempool.next_nonce(&self.wallet.address(), chain.state());
            let transaction = self
                .wallet
                .create_transaction(to, amount, fee, nonce, payload);
            mempool.insert(Arc::new(transaction.clone()), chain.state())?;
            transaction
        };

        let id = transaction.hash();
        self.p2p.broadcast_transaction(&transaction).await;
        Ok(id)
    }

    pub async fn get_balance(&self, address: &Address) -> u64 {
        self.chain.read().await.state().get_balance(address)
    }

    pub async fn get_stake(&self, address: &Address) -> u64 {
        self.chain.read().await.state().get_stake(address)
    }

    pub async fn get_nonce(&self, address: &Address) -> u64 {
        self.chain.read().await.state().get_nonce(address)
    }

    pub async fn get_chain_height(&self) -> u64 {
        self.chain.read().await.height()
    }

    pub async fn get_last_block(&self) -> Arc<Block> {
        self.chain.read().await.tip()
    }

    pub async fn get_mempool_size(&self) -> usize {
        self.mempool.lock().await.size()
    }
}
