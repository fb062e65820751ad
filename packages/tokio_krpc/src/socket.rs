use std::net::SocketAddr;

use krpc_encoding::Message;
use tokio::net::UdpSocket;

/// A DHT datagram never approaches the Ethernet MTU; this is generous
/// headroom over the largest realistic `find_node` response.
const RECV_BUFFER_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("failed to decode inbound datagram from {from}")]
    Decode {
        from: SocketAddr,
        #[source]
        cause: krpc_encoding::CodecError,
    },

    #[error("failed to encode outbound message")]
    Encode(#[source] krpc_encoding::CodecError),
}

/// Thin wrapper around a bound [`tokio::net::UdpSocket`] that speaks KRPC
/// messages instead of raw bytes.
pub struct KrpcSocket {
    socket: UdpSocket,
}

impl KrpcSocket {
    pub async fn bind(addr: SocketAddr) -> Result<KrpcSocket, SocketError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(KrpcSocket { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, message: &Message, to: SocketAddr) -> Result<(), SocketError> {
        let bytes = message.encode().map_err(SocketError::Encode)?;
        self.socket.send_to(&bytes, to).await?;
        Ok(())
    }

    /// Receives the next datagram. A datagram that fails to decode is
    /// returned as an error rather than panicking or silently dropped, so
    /// the caller can log it at `Warning` and continue (spec §7).
    pub async fn recv(&self) -> Result<(Message, SocketAddr), SocketError> {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        let message =
            Message::decode(&buf[..len]).map_err(|cause| SocketError::Decode { from, cause })?;
        Ok((message, from))
    }
}
