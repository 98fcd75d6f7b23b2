use crate::core::error::BlockchainError;
use tessera_common::serializer::ReaderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("Unknown packet id {0}")]
    UnknownPacketId(u8),

    #[error("Invalid handshake: {0}")]
    InvalidHandshake(&'static str),

    #[error("Peer is on a different network")]
    InvalidNetworkId,

    #[error("Already connected to peer {0}")]
    AlreadyConnected(String),

    #[error("Peer limit reached")]
    PeerListFull,

    #[error("Packet of {0} bytes exceeds the limit")]
    PacketTooLarge(u32),

    #[error("Peer send channel is closed")]
    SendChannelClosed,

    #[error("Timeout while sending to peer")]
    SendTimeout,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection closed")]
    Disconnected,

    #[error(transparent)]
    Codec(#[from] ReaderError),

    #[error(transparent)]
    Blockchain(#[from] BlockchainError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
