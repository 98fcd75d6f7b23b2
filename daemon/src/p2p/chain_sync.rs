//! Range sync and checkpoint-assisted sync.
//!
//! Range sync walks batches of at most `MAX_SYNC_BATCH` blocks forward
//! from a requested height. Checkpoint sync bootstraps a node with the
//! latest checkpoint plus every older one (so historic block tags can be
//! validated) and replays blocks from genesis through the normal apply
//! path; snapshot state is not injected directly in this revision.

use super::{
    packet::{CheckpointRequest, CheckpointResponse, Packet, SyncRequest, SyncResponse},
    peer::Peer,
    P2pServer,
};
use crate::{
    config::{CHECKPOINT_SYNC_THRESHOLD, MAX_SYNC_BATCH},
    core::{
        error::BlockchainError,
        storage::{CheckpointProvider, Storage},
    },
    p2p::error::P2pError,
};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tessera_common::block::Block;

impl<S: Storage> P2pServer<S> {
    /// Decide how to catch up with a peer that is ahead of us: a large
    /// gap (or an empty local chain) goes through checkpoint sync, a
    /// small one through plain range sync.
    pub(super) async fn probe_peer(&self, peer: &Arc<Peer>) -> Result<(), P2pError> {
        let local_height = self.chain.read().await.height();
        let peer_height = peer.get_height();
        if peer_height <= local_height {
            return Ok(());
        }

        if local_height == 0 || peer_height - local_height > CHECKPOINT_SYNC_THRESHOLD {
            debug!(
                "bootstrapping from {} (height {} vs local {})",
                peer, peer_height, local_height
            );
            peer.send_packet(&Packet::CheckpointRequest(CheckpointRequest {
                requested_height: 0,
            }))
            .await
        } else {
            self.request_sync_from(peer, local_height + 1).await
        }
    }

    pub(super) async fn request_sync_from(
        &self,
        peer: &Arc<Peer>,
        from_height: u64,
    ) -> Result<(), P2pError> {
        trace!("requesting blocks from height {} from {}", from_height, peer);
        peer.send_packet(&Packet::SyncRequest(SyncRequest { from_height }))
            .await
    }

    /// Server side of range sync: blocks `[from, from + MAX_SYNC_BATCH)`
    /// clamped to our height, loaded by height (storage-backed for
    /// anything older than the in-memory suffix). A storage failure ends
    /// the batch early; whatever was assembled is still sent.
    pub(super) async fn handle_sync_request(
        &self,
        peer: &Arc<Peer>,
        request: SyncRequest,
    ) -> Result<(), P2pError> {
        let blocks = {
            let chain = self.chain.read().await;
            let from = request.from_height;
            let to = from.saturating_add(MAX_SYNC_BATCH as u64 - 1);
            match chain.range(from, to).await {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!("failed to assemble sync response for {}: {}", peer, e);
                    Vec::new()
                }
            }
        };

        debug!(
            "serving {} blocks from height {} to {}",
            blocks.len(),
            request.from_height,
            peer
        );
        let blocks: Vec<Block> = blocks.iter().map(|block| (**block).clone()).collect();
        peer.send_packet(&Packet::SyncResponse(SyncResponse { blocks }))
            .await
    }

    /// Client side of range sync: apply the batch in order, then keep
    /// pulling while the peer is still ahead. A linkage failure deep
    /// enough to be a fork retries one batch further back so the fork
    /// evaluation sees the divergence point.
    pub(super) async fn handle_sync_response(
        &self,
        peer: &Arc<Peer>,
        response: SyncResponse,
    ) -> Result<(), P2pError> {
        if response.blocks.is_empty() {
            trace!("empty sync response from {}", peer);
            return Ok(());
        }

        let batch_len = response.blocks.len();
        let first_height = response.blocks[0].height();
        let result = {
            let mut chain = self.chain.write().await;
            chain
                .process_sync_blocks(response.blocks, &self.checkpoints)
                .await
        };

        match result {
            Ok(applied) => {
                let local_height = self.chain.read().await.height();
                if applied > 0 {
                    info!(
                        "applied {} synced blocks from {}, local height now {}",
                        applied, peer, local_height
                    );
                }
                // Full batch and the peer is still ahead: pull the next one
                if batch_len == MAX_SYNC_BATCH && peer.get_height() > local_height {
                    self.request_sync_from(peer, local_height + 1).await?;
                }
                Ok(())
            }
            Err(BlockchainError::InvalidLinkage { .. }) => {
                // The peer's chain diverges before this batch. Step one
                // batch further back so the next response includes the
                // common ancestor and the fork rule can be evaluated.
                let retry_from = first_height
                    .saturating_sub(MAX_SYNC_BATCH as u64)
                    .max(1);
                if retry_from < first_height {
                    debug!(
                        "sync batch from {} did not link, retrying from height {}",
                        peer, retry_from
                    );
                    self.request_sync_from(peer, retry_from).await?;
                }
                Ok(())
            }
            Err(e) => {
                warn!("aborted sync batch from {}: {}", peer, e);
                Ok(())
            }
        }
    }

    /// Server side of checkpoint sync: latest (or requested) checkpoint,
    /// all other stored checkpoints, and the first block batch from
    /// height 1.
    pub(super) async fn handle_checkpoint_request(
        &self,
        peer: &Arc<Peer>,
        request: CheckpointRequest,
    ) -> Result<(), P2pError> {
        let response = {
            let chain = self.chain.read().await;
            let storage = chain.storage();

            let heights = match storage.get_checkpoint_heights().await {
                Ok(heights) => heights,
                Err(e) => {
                    warn!("failed to list checkpoints for {}: {}", peer, e);
                    Vec::new()
                }
            };
            let chosen = if request.requested_height == 0 {
                heights.last().copied()
            } else {
                heights
                    .iter()
                    .copied()
                    .find(|h| *h == request.requested_height)
            };

            let mut checkpoint = None;
            let mut all_checkpoints = Vec::new();
            for height in &heights {
                match storage.get_checkpoint_at_height(*height).await {
                    Ok(Some(cp)) => {
                        if Some(*height) == chosen {
                            checkpoint = Some(cp);
                        } else {
                            all_checkpoints.push(cp);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("failed to load checkpoint {}: {}", height, e),
                }
            }

            let to = (MAX_SYNC_BATCH as u64).min(chain.height());
            let blocks_since = match chain.range(1, to).await {
                Ok(blocks) => blocks.iter().map(|block| (**block).clone()).collect(),
                Err(e) => {
                    warn!("failed to assemble bootstrap blocks for {}: {}", peer, e);
                    Vec::new()
                }
            };

            CheckpointResponse {
                checkpoint,
                blocks_since,
                all_checkpoints,
            }
        };

        debug!(
            "serving checkpoint response to {} (checkpoint: {}, blocks: {}, extra checkpoints: {})",
            peer,
            response.checkpoint.is_some(),
            response.blocks_since.len(),
            response.all_checkpoints.len()
        );
        peer.send_packet(&Packet::CheckpointResponse(response)).await
    }

    /// Client side of checkpoint sync: validate and persist every
    /// received checkpoint, replay the block batch through the normal
    /// apply path, then continue with range sync while behind.
    pub(super) async fn handle_checkpoint_response(
        &self,
        peer: &Arc<Peer>,
        response: CheckpointResponse,
    ) -> Result<(), P2pError> {
        {
            let mut chain = self.chain.write().await;
            for checkpoint in response
                .all_checkpoints
                .into_iter()
                .chain(response.checkpoint.into_iter())
            {
                let height = checkpoint.height;
                match self
                    .checkpoints
                    .store_received_checkpoint(checkpoint, chain.storage_mut())
                    .await
                {
                    Ok(()) => trace!("stored checkpoint at height {} from {}", height, peer),
                    Err(e) => warn!("rejected checkpoint at height {} from {}: {}", height, peer, e),
                }
            }

            if !response.blocks_since.is_empty() {
                match chain
                    .process_sync_blocks(response.blocks_since, &self.checkpoints)
                    .await
                {
                    Ok(applied) if applied > 0 => {
                        info!(
                            "bootstrap applied {} blocks from {}, local height now {}",
                            applied,
                            peer,
                            chain.height()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("aborted bootstrap batch from {}: {}", peer, e),
                }
            }
        }

        let local_height = self.chain.read().await.height();
        if peer.get_height() > local_height {
            self.request_sync_from(peer, local_height + 1).await?;
        }
        Ok(())
    }
}
