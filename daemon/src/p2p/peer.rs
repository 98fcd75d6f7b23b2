use super::{error::P2pError, packet::Packet};
use crate::config::{
    PEER_BLOCK_CACHE_SIZE, PEER_SEND_TIMEOUT_MILLIS, PEER_TX_CACHE_SIZE,
};
use bytes::Bytes;
use lru::LruCache;
use std::fmt::{Display, Error as FmtError, Formatter};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tessera_common::{
    crypto::Hash,
    serializer::Serializer,
    time::get_current_time_in_seconds,
};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

const _: () = assert!(PEER_TX_CACHE_SIZE > 0, "PEER_TX_CACHE_SIZE must be non-zero");
const _: () = assert!(
    PEER_BLOCK_CACHE_SIZE > 0,
    "PEER_BLOCK_CACHE_SIZE must be non-zero"
);

/// A connected remote node. Holds the outbound frame channel, the peer's
/// announced chain position and the caches used to avoid echoing items
/// back to whoever already has them.
pub struct Peer {
    id: u64,
    addr: SocketAddr,
    node_id: String,
    version: String,
    outgoing: bool,
    // frames drained by the writer task of this peer
    tx: mpsc::Sender<Bytes>,
    // data channel became usable (handshake completed both ways)
    ready: AtomicBool,
    closed: AtomicBool,
    // highest height the peer has announced
    height: AtomicU64,
    top_hash: Mutex<Hash>,
    last_seen: AtomicU64,
    // fixed-window inbound rate limiting
    rate_window_start: AtomicU64,
    rate_count: AtomicU32,
    // items this peer already knows about
    txs_cache: Mutex<LruCache<Hash, ()>>,
    blocks_cache: Mutex<LruCache<Hash, ()>>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        addr: SocketAddr,
        node_id: String,
        version: String,
        outgoing: bool,
        tx: mpsc::Sender<Bytes>,
        height: u64,
        top_hash: Hash,
    ) -> Self {
        Self {
            id,
            addr,
            node_id,
            version,
            outgoing,
            tx,
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            height: AtomicU64::new(height),
            top_hash: Mutex::new(top_hash),
            last_seen: AtomicU64::new(get_current_time_in_seconds()),
            rate_window_start: AtomicU64::new(get_current_time_in_seconds()),
            rate_count: AtomicU32::new(0),
            txs_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(PEER_TX_CACHE_SIZE).expect("checked at compile time"),
            )),
            blocks_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(PEER_BLOCK_CACHE_SIZE).expect("checked at compile time"),
            )),
        }
    }

    pub fn get_id(&self) -> u64 {
        self.id
    }

    pub fn get_addr(&self) -> &SocketAddr {
        &self.addr
    }

    pub fn get_node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get_version(&self) -> &str {
        &self.version
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn get_height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub async fn get_top_hash(&self) -> Hash {
        self.top_hash.lock().await.clone()
    }

    pub async fn set_top_hash(&self, hash: Hash) {
        *self.top_hash.lock().await = hash;
    }

    pub fn get_last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_seen
            .store(get_current_time_in_seconds(), Ordering::SeqCst);
    }

    /// Fixed-window rate limiter: returns false when this peer exceeded
    /// its per-second inbound budget.
    pub fn check_rate_limit(&self, max_per_second: u32) -> bool {
        let now = get_current_time_in_seconds();
        let window = self.rate_window_start.load(Ordering::SeqCst);
        if now != window {
            self.rate_window_start.store(now, Ordering::SeqCst);
            self.rate_count.store(1, Ordering::SeqCst);
            return true;
        }
        self.rate_count.fetch_add(1, Ordering::SeqCst) < max_per_second
    }

    /// Queue a packet for the writer task. Never blocks indefinitely: a
    /// peer that cannot drain its channel within the timeout is treated
    /// as gone.
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), P2pError> {
        if self.is_closed() {
            return Err(P2pError::SendChannelClosed);
        }
        let bytes = Bytes::from(packet.to_bytes());
        match timeout(
            Duration::from_millis(PEER_SEND_TIMEOUT_MILLIS),
            self.tx.send(bytes),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(P2pError::SendChannelClosed),
            Err(_) => Err(P2pError::SendTimeout),
        }
    }

    pub async fn knows_transaction(&self, hash: &Hash) -> bool {
        self.txs_cache.lock().await.contains(hash)
    }

    pub async fn mark_transaction(&self, hash: Hash) {
        self.txs_cache.lock().await.put(hash, ());
    }

    pub async fn knows_block(&self, hash: &Hash) -> bool {
        self.blocks_cache.lock().await.contains(hash)
    }

    pub async fn mark_block(&self, hash: Hash) {
        self.blocks_cache.lock().await.put(hash, ());
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "Peer[{} - {} ({}), height: {}]",
            self.id,
            self.node_id,
            self.addr,
            self.get_height()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> (Peer, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        let peer = Peer::new(
            1,
            "127.0.0.1:2690".parse().unwrap(),
            "node-a".into(),
            "0.1.0".into(),
            true,
            tx,
            0,
            Hash::zero(),
        );
        (peer, rx)
    }

    #[tokio::test]
    async fn test_send_packet_reaches_writer_channel() {
        let (peer, mut rx) = test_peer();
        let packet = Packet::SyncRequest(super::super::packet::SyncRequest { from_height: 3 });
        peer.send_packet(&packet).await.unwrap();

        let bytes = rx.recv().await.unwrap();
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (peer, _rx) = test_peer();
        peer.mark_closed();
        let packet = Packet::SyncRequest(super::super::packet::SyncRequest { from_height: 3 });
        assert!(peer.send_packet(&packet).await.is_err());
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let (peer, _rx) = test_peer();
        // 50 immediate calls span at most two one-second windows, so a
        // budget of 5 per window must reject most of them
        let rejected = (0..50)
            .filter(|_| !peer.check_rate_limit(5))
            .count();
        assert!(rejected >= 40, "only {} calls were rejected", rejected);
    }

    #[tokio::test]
    async fn test_propagation_caches() {
        let (peer, _rx) = test_peer();
        let hash = Hash::max();
        assert!(!peer.knows_block(&hash).await);
        peer.mark_block(hash.clone()).await;
        assert!(peer.knows_block(&hash).await);
    }
}
