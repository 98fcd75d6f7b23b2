use super::{error::P2pError, packet::Packet};
use crate::config::PEER_MAX_PACKET_SIZE;
use tessera_common::serializer::Serializer;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

/// Write one length-prefixed frame: u32 big-endian length, then payload.
pub async fn write_frame(stream: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), P2pError> {
    let len = bytes.len() as u32;
    if len > PEER_MAX_PACKET_SIZE {
        return Err(P2pError::PacketTooLarge(len));
    }
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, rejecting oversized lengths before
/// allocating anything.
pub async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Vec<u8>, P2pError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > PEER_MAX_PACKET_SIZE {
        return Err(P2pError::PacketTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// A freshly established TCP connection, used directly only for the
/// handshake. Afterwards it is split into halves owned by the reader and
/// writer tasks of the peer.
pub struct Connection {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self { read, write }
    }

    pub async fn send_packet(&mut self, packet: &Packet) -> Result<(), P2pError> {
        write_frame(&mut self.write, &packet.to_bytes()).await
    }

    pub async fn read_packet(&mut self) -> Result<Packet, P2pError> {
        let bytes = read_frame(&mut self.read).await?;
        Ok(Packet::from_bytes(&bytes)?)
    }

    pub fn split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        (self.read, self.write)
    }
}
