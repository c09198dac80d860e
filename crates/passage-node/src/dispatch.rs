//! Routes inbound datagrams to packet receivers by their 8-byte magic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use passage_core::wire::packet_magic;

use crate::socket::Socket;

/// A receiver bound to one or more packet magics.
///
/// `receive` runs on the socket pump task and must not block; receivers
/// either handle the packet synchronously or forward it through a
/// channel.
pub trait PacketReceiver: Send + Sync {
    fn receive(&self, socket: &Arc<dyn Socket>, buf: Bytes, src: SocketAddr);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("magic {0:#018x} is already bound")]
    MagicBound(u64),
}

/// Per-host dispatcher: the only component that sees every datagram.
///
/// The map is written at bind/unbind time and read per-datagram, so a
/// plain RwLock keeps readers cheap.
pub struct PacketDispatcher {
    receivers: RwLock<HashMap<u64, Arc<dyn PacketReceiver>>>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self {
            receivers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a receiver for a magic. A second bind of the same magic
    /// is rejected; unbind first to replace.
    pub fn bind(&self, magic: u64, receiver: Arc<dyn PacketReceiver>) -> Result<(), DispatchError> {
        let mut map = self.receivers.write().unwrap();
        if map.contains_key(&magic) {
            return Err(DispatchError::MagicBound(magic));
        }
        map.insert(magic, receiver);
        Ok(())
    }

    pub fn unbind(&self, magic: u64) {
        self.receivers.write().unwrap().remove(&magic);
    }

    /// Route one datagram: drop undersize, read the little-endian
    /// magic, forward to the bound receiver, drop on miss. No state, no
    /// retransmission — a pure function of the binding map and input.
    pub fn dispatch(&self, socket: &Arc<dyn Socket>, buf: Bytes, src: SocketAddr) {
        let Some(magic) = packet_magic(&buf) else {
            tracing::trace!(len = buf.len(), %src, "dropping undersize datagram");
            return;
        };
        let receiver = self.receivers.read().unwrap().get(&magic).cloned();
        match receiver {
            Some(receiver) => receiver.receive(socket, buf, src),
            None => {
                tracing::trace!(magic, %src, "no receiver bound");
            }
        }
    }
}

impl Default for PacketDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
