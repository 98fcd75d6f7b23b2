use super::{packet::Packet, peer::Peer};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SharedPeerList = Arc<PeerList>;

/// All connected peers, keyed by their runtime id. Dispatch tasks hold
/// ids and resolve the peer on demand; nothing outside this map keeps a
/// peer alive.
pub struct PeerList {
    peers: RwLock<HashMap<u64, Arc<Peer>>>,
    next_id: AtomicU64,
}

impl PeerList {
    pub fn new() -> SharedPeerList {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn next_peer_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn size(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn add(&self, peer: Arc<Peer>) {
        debug!("registering {}", peer);
        self.peers.write().await.insert(peer.get_id(), peer);
    }

    pub async fn remove(&self, id: u64) -> Option<Arc<Peer>> {
        let removed = self.peers.write().await.remove(&id);
        if let Some(peer) = &removed {
            peer.mark_closed();
            debug!("removed {}", peer);
        }
        removed
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn get_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn is_connected_to(&self, node_id: &str) -> bool {
        self.peers
            .read()
            .await
            .values()
            .any(|peer| peer.get_node_id() == node_id)
    }

    /// Best ready peer strictly ahead of the given height, if any
    pub async fn best_peer_ahead(&self, height: u64) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| peer.is_ready() && peer.get_height() > height)
            .max_by_key(|peer| peer.get_height())
            .cloned()
    }

    /// Send a packet to every ready peer except the excluded one. The
    /// peer set lock is released before any send happens.
    pub async fn broadcast_except(&self, packet: &Packet, except: Option<u64>) {
        let peers = self.get_peers().await;
        for peer in peers {
            if Some(peer.get_id()) == except || !peer.is_ready() {
                continue;
            }
            if let Err(e) = peer.send_packet(packet).await {
                trace!("failed to broadcast {} to {}: {}", packet.kind(), peer, e);
            }
        }
    }

    pub async fn clear(&self) {
        let mut peers = self.peers.write().await;
        for peer in peers.values() {
            peer.mark_closed();
        }
        peers.clear();
    }
}
