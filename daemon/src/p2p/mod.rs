mod chain_sync;
pub mod connection;
pub mod error;
pub mod gossip;
pub mod packet;
pub mod peer;
pub mod peer_list;

use crate::{
    config::{
        GOSSIP_CACHE_SIZE, GOSSIP_MAX_HOPS, GOSSIP_TTL, PEER_PACKET_CHANNEL_SIZE,
        PEER_RATE_LIMIT_PER_SECOND, PEER_STALE_AFTER_SECONDS, PEER_TIMEOUT_INIT_CONNECTION,
    },
    core::{
        blockchain::Chain, checkpoint::CheckpointEngine, error::BlockchainError,
        mempool::Mempool, storage::Storage,
    },
};
use connection::{read_frame, write_frame, Connection};
use error::P2pError;
use gossip::GossipTracker;
use log::{debug, info, trace, warn};
use metrics::counter;
use packet::{BlockPropagation, Handshake, Packet, TransactionPropagation};
use peer::Peer;
use peer_list::{PeerList, SharedPeerList};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{
    block::Block, config::VERSION, crypto::Hash, serializer::Serializer,
    time::get_current_time_in_seconds, transaction::Transaction,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex, RwLock},
    time::{interval, timeout},
};

/// P2p side of the node: listens for peers, dials the configured ones,
/// runs one dispatch task and one writer task per peer, and routes every
/// inbound packet to the chain, the mempool or the sync protocol.
pub struct P2pServer<S: Storage> {
    node_id: String,
    bind_address: SocketAddr,
    max_peers: usize,
    min_peers: usize,
    priority_peers: Vec<SocketAddr>,
    discovery_interval: Duration,
    peer_list: SharedPeerList,
    chain: Arc<RwLock<Chain<S>>>,
    mempool: Arc<Mutex<Mempool>>,
    checkpoints: Arc<CheckpointEngine>,
    gossip: GossipTracker,
    shutdown: watch::Receiver<bool>,
    // per-connection task handles, awaited on stop
    connection_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<S: Storage> P2pServer<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        bind_address: SocketAddr,
        max_peers: usize,
        min_peers: usize,
        priority_peers: Vec<SocketAddr>,
        discovery_interval: Duration,
        chain: Arc<RwLock<Chain<S>>>,
        mempool: Arc<Mutex<Mempool>>,
        checkpoints: Arc<CheckpointEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            bind_address,
            max_peers,
            min_peers,
            priority_peers,
            discovery_interval,
            peer_list: PeerList::new(),
            chain,
            mempool,
            checkpoints,
            gossip: GossipTracker::new(GOSSIP_CACHE_SIZE),
            shutdown,
            connection_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn get_node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get_peer_list(&self) -> &SharedPeerList {
        &self.peer_list
    }

    /// Bind the listener and start the accept and discovery loops.
    /// Returns their join handles so the runtime can await them on stop.
    pub async fn start(
        self: &Arc<Self>,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>, P2pError> {
        let listener = TcpListener::bind(self.bind_address).await?;
        info!("p2p listening on {}", self.bind_address);

        let accept = tokio::spawn(Arc::clone(self).accept_loop(listener));
        let discovery = tokio::spawn(Arc::clone(self).discovery_loop());
        Ok(vec![accept, discovery])
    }

    /// Close every peer and wait for their tasks to wind down. Must be
    /// called after the shutdown signal has been flipped.
    pub async fn stop(&self) {
        self.peer_list.clear().await;
        // Drain in rounds without holding the lock across awaits: a
        // winding-down connection task may still need it to register its
        // writer handle
        loop {
            let tasks: Vec<_> = {
                let mut guard = self.connection_tasks.lock().await;
                guard.drain(..).collect()
            };
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
        info!("p2p stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.peer_list.size().await >= self.max_peers {
                                debug!("peer limit reached, refusing {}", addr);
                                continue;
                            }
                            let zelf = Arc::clone(&self);
                            let handle = tokio::spawn(async move {
                                if let Err(e) = zelf.handle_connection(stream, addr, false).await {
                                    debug!("incoming connection {} ended: {}", addr, e);
                                }
                            });
                            self.connection_tasks.lock().await.push(handle);
                        }
                        Err(e) => {
                            warn!("accept failed: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("accept loop received shutdown signal");
                    return;
                }
            }
        }
    }

    /// Dial a peer and run its connection on the current task.
    pub async fn connect_to_peer(self: &Arc<Self>, addr: SocketAddr) {
        let zelf = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = zelf.handle_connection(stream, addr, true).await {
                        debug!("outgoing connection {} ended: {}", addr, e);
                    }
                }
                Err(e) => debug!("could not connect to {}: {}", addr, e),
            }
        });
        self.connection_tasks.lock().await.push(handle);
    }

    async fn build_handshake(&self) -> Handshake {
        let chain = self.chain.read().await;
        Handshake::new(
            self.node_id.clone(),
            VERSION.to_owned(),
            chain.height(),
            chain.tip_hash().clone(),
        )
    }

    // Full lifecycle of one peer connection: handshake, registration,
    // writer task, dispatch loop, cleanup.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        outgoing: bool,
    ) -> Result<(), P2pError> {
        let mut connection = Connection::new(stream);

        // Exchange handshakes; order does not matter as both sides send
        // theirs immediately
        let ours = self.build_handshake().await;
        connection.send_packet(&Packet::Handshake(ours)).await?;
        let theirs = match timeout(
            Duration::from_millis(PEER_TIMEOUT_INIT_CONNECTION),
            connection.read_packet(),
        )
        .await
        {
            Ok(Ok(Packet::Handshake(handshake))) => handshake,
            Ok(Ok(_)) => return Err(P2pError::InvalidHandshake("expected a handshake first")),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(P2pError::HandshakeTimeout),
        };

        if theirs.network_id != tessera_common::config::NETWORK_ID {
            return Err(P2pError::InvalidNetworkId);
        }
        if theirs.node_id == self.node_id {
            return Err(P2pError::InvalidHandshake("connected to ourselves"));
        }
        if self.peer_list.is_connected_to(&theirs.node_id).await {
            return Err(P2pError::AlreadyConnected(theirs.node_id));
        }

        let (tx, mut rx) = mpsc::channel(PEER_PACKET_CHANNEL_SIZE);
        let peer = Arc::new(Peer::new(
            self.peer_list.next_peer_id(),
            addr,
            theirs.node_id.clone(),
            theirs.version.clone(),
            outgoing,
            tx,
            theirs.height,
            theirs.tip_hash.clone(),
        ));
        peer.set_ready();
        self.peer_list.add(Arc::clone(&peer)).await;
        info!("connected to {}", peer);
        counter!("tessera_p2p_connections").increment(1);

        let (mut read_half, mut write_half) = connection.split();

        // Writer task: drains the outbound channel until it closes
        let writer_peer = Arc::clone(&peer);
        let mut writer_shutdown = self.shutdown.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = rx.recv() => {
                        match frame {
                            Some(bytes) => {
                                if let Err(e) = write_frame(&mut write_half, &bytes).await {
                                    debug!("write to {} failed: {}", writer_peer, e);
                                    writer_peer.mark_closed();
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                    _ = writer_shutdown.changed() => return,
                }
            }
        });
        self.connection_tasks.lock().await.push(writer);

        // A freshly connected peer that is ahead gets probed right away
        if let Err(e) = self.probe_peer(&peer).await {
            debug!("initial sync probe of {} failed: {}", peer, e);
        }

        // Dispatch loop: frames of this peer are processed in arrival
        // order; handler errors never abort the task
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                frame = read_frame(&mut read_half) => {
                    let bytes = match frame {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!("read from {} failed: {}", peer, e);
                            break;
                        }
                    };
                    match Packet::from_bytes(&bytes) {
                        Ok(packet) => {
                            if let Err(e) = self.handle_packet(&peer, packet).await {
                                // Tolerant path: log and keep the peer
                                debug!("error handling packet from {}: {}", peer, e);
                                counter!("tessera_p2p_packet_errors").increment(1);
                            }
                        }
                        Err(e) => {
                            // Malformed or unknown packet: drop the frame
                            warn!("undecodable packet from {}: {}", peer, e);
                            counter!("tessera_p2p_protocol_errors").increment(1);
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        peer.mark_closed();
        self.peer_list.remove(peer.get_id()).await;
        info!("disconnected from {}", peer);
        Ok(())
    }

    async fn handle_packet(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        packet: Packet,
    ) -> Result<(), P2pError> {
        peer.touch();
        if !peer.check_rate_limit(PEER_RATE_LIMIT_PER_SECOND) {
            counter!("tessera_p2p_rate_limited").increment(1);
            trace!("rate limited a {} packet from {}", packet.kind(), peer);
            return Ok(());
        }

        match packet {
            Packet::Handshake(handshake) => {
                // Mid-stream handshakes act as height announcements
                peer.set_height(handshake.height);
                peer.set_top_hash(handshake.tip_hash).await;
                let local_height = self.chain.read().await.height();
                if handshake.height > local_height {
                    self.probe_peer(peer).await?;
                }
                Ok(())
            }
            Packet::BlockPropagation(propagation) => {
                self.handle_block_propagation(peer, propagation).await
            }
            Packet::TransactionPropagation(propagation) => {
                self.handle_transaction_propagation(peer, propagation).await
            }
            Packet::SyncRequest(request) => self.handle_sync_request(peer, request).await,
            Packet::SyncResponse(response) => self.handle_sync_response(peer, response).await,
            Packet::CheckpointRequest(request) => {
                self.handle_checkpoint_request(peer, request).await
            }
            Packet::CheckpointResponse(response) => {
                self.handle_checkpoint_response(peer, response).await
            }
        }
    }

    async fn handle_block_propagation(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        propagation: BlockPropagation,
    ) -> Result<(), P2pError> {
        let BlockPropagation {
            origin,
            ttl,
            hops,
            block,
        } = propagation;
        let hash = block.hash();
        peer.mark_block(hash.clone()).await;
        if block.height() > peer.get_height() {
            peer.set_height(block.height());
            peer.set_top_hash(hash.clone()).await;
        }

        if !self.gossip.should_process(&origin, &hash).await {
            trace!("dropping already seen block {} from {}", hash, peer);
            counter!("tessera_gossip_deduplicated").increment(1);
            return Ok(());
        }

        let apply_result = {
            let mut chain = self.chain.write().await;
            chain.apply_block(block.clone(), &self.checkpoints).await
        };

        match apply_result {
            Ok(applied) => {
                info!("accepted propagated {}", applied);
                // Included transactions are no longer pending
                let ids: Vec<Hash> = applied
                    .transactions
                    .iter()
                    .filter(|tx| !tx.is_coinbase())
                    .map(|tx| tx.hash())
                    .collect();
                if !ids.is_empty() {
                    self.mempool.lock().await.remove_many(ids.iter());
                }
                self.rebroadcast_block(peer, origin, ttl, hops, block).await;
                Ok(())
            }
            Err(BlockchainError::DuplicateHash(_)) => Ok(()),
            Err(BlockchainError::InvalidLinkage { .. }) => {
                let local_height = self.chain.read().await.height();
                if block.height() > local_height + 1 {
                    // The peer is ahead of us, recover the gap
                    debug!(
                        "gap detected: block at height {} vs local {}",
                        block.height(),
                        local_height
                    );
                    self.probe_peer(peer).await
                } else {
                    // Same-height sibling or older block: fetch enough of
                    // the peer's chain to evaluate the fork rule
                    let from = block
                        .height()
                        .saturating_sub(crate::config::MAX_SYNC_BATCH as u64 / 2)
                        .max(1);
                    debug!(
                        "possible fork at height {} from {}, requesting range from {}",
                        block.height(),
                        peer,
                        from
                    );
                    self.request_sync_from(peer, from).await
                }
            }
            Err(e) => {
                // Validation failure: count it, drop the block, keep the peer
                debug!("rejected propagated block {} from {}: {}", hash, peer, e);
                counter!("tessera_blocks_rejected").increment(1);
                Ok(())
            }
        }
    }

    async fn rebroadcast_block(
        &self,
        from_peer: &Arc<Peer>,
        origin: String,
        ttl: u8,
        hops: u8,
        block: Block,
    ) {
        if ttl <= 1 || hops >= GOSSIP_MAX_HOPS {
            trace!("not rebroadcasting block: ttl {} hops {}", ttl, hops);
            return;
        }
        let hash = block.hash();
        let packet = Packet::BlockPropagation(BlockPropagation {
            origin,
            ttl: ttl - 1,
            hops: hops + 1,
            block,
        });
        let peers = self.peer_list.get_peers().await;
        for other in peers {
            if other.get_id() == from_peer.get_id() || !other.is_ready() {
                continue;
            }
            if other.knows_block(&hash).await {
                continue;
            }
            other.mark_block(hash.clone()).await;
            if let Err(e) = other.send_packet(&packet).await {
                trace!("failed to relay block to {}: {}", other, e);
            }
        }
    }

    async fn handle_transaction_propagation(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        propagation: TransactionPropagation,
    ) -> Result<(), P2pError> {
        let TransactionPropagation {
            origin,
            ttl,
            hops,
            transaction,
        } = propagation;
        let hash = transaction.hash();
        peer.mark_transaction(hash.clone()).await;

        if !self.gossip.should_process(&origin, &hash).await {
            trace!("dropping already seen transaction {} from {}", hash, peer);
            counter!("tessera_gossip_deduplicated").increment(1);
            return Ok(());
        }

        let insert_result = {
            // Lock order: chain before mempool
            let chain = self.chain.read().await;
            let mut mempool = self.mempool.lock().await;
            mempool.insert(Arc::new(transaction.clone()), chain.state())
        };

        match insert_result {
            Ok(id) => {
                debug!("accepted propagated transaction {}", id);
                self.rebroadcast_transaction(peer, origin, ttl, hops, transaction)
                    .await;
                Ok(())
            }
            Err(e) => {
                trace!("rejected propagated transaction {}: {}", hash, e);
                counter!("tessera_transactions_rejected").increment(1);
                Ok(())
            }
        }
    }

    async fn rebroadcast_transaction(
        &self,
        from_peer: &Arc<Peer>,
        origin: String,
        ttl: u8,
        hops: u8,
        transaction: Transaction,
    ) {
        if ttl <= 1 || hops >= GOSSIP_MAX_HOPS {
            return;
        }
        let hash = transaction.hash();
        let packet = Packet::TransactionPropagation(TransactionPropagation {
            origin,
            ttl: ttl - 1,
            hops: hops + 1,
            transaction,
        });
        let peers = self.peer_list.get_peers().await;
        for other in peers {
            if other.get_id() == from_peer.get_id() || !other.is_ready() {
                continue;
            }
            if other.knows_transaction(&hash).await {
                continue;
            }
            other.mark_transaction(hash.clone()).await;
            if let Err(e) = other.send_packet(&packet).await {
                trace!("failed to relay transaction to {}: {}", other, e);
            }
        }
    }

    /// Announce a locally produced block to every ready peer.
    pub async fn broadcast_block(&self, block: &Block) {
        let hash = block.hash();
        // Remember our own fingerprint so relayed echoes are dropped
        self.gossip.mark_seen(&self.node_id, &hash).await;
        let packet = Packet::BlockPropagation(BlockPropagation {
            origin: self.node_id.clone(),
            ttl: GOSSIP_TTL,
            hops: 0,
            block: block.clone(),
        });
        self.peer_list.broadcast_except(&packet, None).await;
    }

    /// Announce a locally created transaction to every ready peer.
    pub async fn broadcast_transaction(&self, transaction: &Transaction) {
        let hash = transaction.hash();
        self.gossip.mark_seen(&self.node_id, &hash).await;
        let packet = Packet::TransactionPropagation(TransactionPropagation {
            origin: self.node_id.clone(),
            ttl: GOSSIP_TTL,
            hops: 0,
            transaction: transaction.clone(),
        });
        self.peer_list.broadcast_except(&packet, None).await;
    }

    // Periodic maintenance: reconnect configured peers, drop stale ones,
    // retry sync against whoever is ahead, and let everyone know our
    // current height.
    async fn discovery_loop(self: Arc<Self>) {
        let mut ticker = interval(self.discovery_interval);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.discovery_tick().await;
                }
                _ = shutdown.changed() => {
                    debug!("discovery loop received shutdown signal");
                    return;
                }
            }
        }
    }

    async fn discovery_tick(self: &Arc<Self>) {
        // Drop peers that went quiet
        let now = get_current_time_in_seconds();
        for peer in self.peer_list.get_peers().await {
            if now.saturating_sub(peer.get_last_seen()) > PEER_STALE_AFTER_SECONDS {
                warn!("dropping stale {}", peer);
                self.peer_list.remove(peer.get_id()).await;
            }
        }

        // Reconnect configured peers we lost
        let connected: Vec<SocketAddr> = self
            .peer_list
            .get_peers()
            .await
            .iter()
            .map(|peer| *peer.get_addr())
            .collect();
        if connected.len() < self.min_peers {
            debug!(
                "connected to {} peers, below the minimum of {}",
                connected.len(),
                self.min_peers
            );
        }
        for addr in &self.priority_peers {
            if !connected.contains(addr) && self.peer_list.size().await < self.max_peers {
                debug!("dialing configured peer {}", addr);
                self.connect_to_peer(*addr).await;
            }
        }

        // Height announcement doubles as a keep-alive
        let handshake = Packet::Handshake(self.build_handshake().await);
        self.peer_list.broadcast_except(&handshake, None).await;

        // Abandoned or timed out sync attempts are retried here
        let local_height = self.chain.read().await.height();
        if let Some(peer) = self.peer_list.best_peer_ahead(local_height).await {
            if let Err(e) = self.probe_peer(&peer).await {
                debug!("sync retry against {} failed: {}", peer, e);
            }
        }

        // Reap finished connection tasks
        self.connection_tasks
            .lock()
            .await
            .retain(|handle| !handle.is_finished());
    }
}
