//! Message receiver — demultiplexes MESSAGE datagrams onto live
//! channels by the short-term key embedded in the packet header.
//!
//! The 32 bytes at offset 8 of a MESSAGE are the sender's short-term
//! public key, so the table is indexed by the channel's *remote* key.
//! Binding additionally enforces the host invariant that no two live
//! channels share a *local* short-term key.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::channel::Channel;
use crate::dispatch::PacketReceiver;
use crate::socket::Socket;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("a live channel already uses this remote short-term key")]
    RemoteKeyInUse,

    #[error("a live channel already uses this local short-term key")]
    LocalKeyInUse,
}

/// Per-host channel table. The receiver does not own channel
/// lifecycles — channels bind on start and unbind themselves.
pub struct MessageReceiver {
    /// remote short-term public key → channel.
    channels: DashMap<[u8; 32], Arc<Channel>>,
}

impl MessageReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
        })
    }

    /// Register a channel under its remote short-term key.
    pub fn bind_channel(&self, channel: Arc<Channel>) -> Result<(), BindError> {
        use dashmap::mapref::entry::Entry;
        if self.channel_with_local(channel.local_short_pk()).is_some() {
            return Err(BindError::LocalKeyInUse);
        }
        match self.channels.entry(*channel.remote_short_pk()) {
            Entry::Occupied(_) => Err(BindError::RemoteKeyInUse),
            Entry::Vacant(slot) => {
                slot.insert(channel);
                Ok(())
            }
        }
    }

    /// Remove the channel bound under `remote_pk`.
    pub fn unbind_channel(&self, remote_pk: &[u8; 32]) {
        self.channels.remove(remote_pk);
    }

    /// O(1) lookup by the key a MESSAGE header carries.
    pub fn channel_for(&self, remote_pk: &[u8; 32]) -> Option<Arc<Channel>> {
        self.channels.get(remote_pk).map(|entry| entry.clone())
    }

    /// Find a channel by its local short-term key. Rare path — used by
    /// the responder's retransmission handling and the bind invariant.
    pub fn channel_with_local(&self, local_pk: &[u8; 32]) -> Option<Arc<Channel>> {
        self.channels
            .iter()
            .find(|entry| entry.value().local_short_pk() == local_pk)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl PacketReceiver for MessageReceiver {
    fn receive(&self, _socket: &Arc<dyn Socket>, buf: Bytes, src: SocketAddr) {
        // The dispatcher guarantees at least 64 bytes.
        let sender_pk: [u8; 32] = buf[8..40].try_into().unwrap();
        match self.channel_for(&sender_pk) {
            Some(channel) => channel.receive(&buf, src),
            None => {
                tracing::trace!(
                    sender = %hex::encode(&sender_pk[..4]),
                    %src,
                    "message for unknown channel"
                );
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
