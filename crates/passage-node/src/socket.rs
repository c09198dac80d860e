//! Socket abstraction — the transport surface the rest of the node is
//! written against.
//!
//! Two implementations exist: [`UdpTransport`] over a real tokio UDP
//! socket, and the in-memory simulated socket in [`crate::sim`]. Both
//! deliver inbound datagrams as `(Bytes, SocketAddr)` pairs through an
//! mpsc channel handed over at creation, and both make `send` a single
//! atomic call, so concurrent senders can never interleave bytes within
//! one datagram.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use passage_core::wire::MTU;

/// One received datagram and where it came from.
pub type Inbound = (Bytes, SocketAddr);

/// Depth of the inbound delivery queue per socket.
pub const INBOUND_QUEUE: usize = 1024;

/// A bound datagram socket.
pub trait Socket: Send + Sync {
    /// Send one datagram. Returns false if the transport refused it
    /// outright; true means handed to the network, which for UDP still
    /// promises nothing.
    fn send(&self, dst: SocketAddr, buf: &[u8]) -> bool;

    /// Local endpoints this socket is reachable on.
    fn local_endpoints(&self) -> Vec<SocketAddr>;
}

// ── UDP ───────────────────────────────────────────────────────────────────────

/// Real-network transport over a tokio UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    /// Bind to `addr` and start the receive pump. Returns the socket
    /// and the inbound delivery queue for the owner to drain.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MTU];
            loop {
                let (len, src) = match recv_socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp recv_from failed");
                        continue;
                    }
                };
                if tx
                    .send((Bytes::copy_from_slice(&buf[..len]), src))
                    .await
                    .is_err()
                {
                    // Owner went away; stop pumping.
                    return;
                }
            }
        });

        Ok((Arc::new(Self { socket, local }), rx))
    }
}

impl Socket for UdpTransport {
    fn send(&self, dst: SocketAddr, buf: &[u8]) -> bool {
        debug_assert!(buf.len() <= MTU);
        match self.socket.try_send_to(buf, dst) {
            Ok(_) => true,
            Err(e) => {
                // Datagram transport: a refused send is a lost packet,
                // and lost packets are already part of the contract.
                tracing::debug!(error = %e, %dst, "udp send dropped");
                false
            }
        }
    }

    fn local_endpoints(&self) -> Vec<SocketAddr> {
        vec![self.local]
    }
}
