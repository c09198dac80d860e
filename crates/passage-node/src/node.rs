//! Node — the per-host composition root.
//!
//! Owns the identity, the dispatcher, the channel table, the key
//! exchange endpoints, and the peer records. Components receive narrow
//! capability handles, never a reference back to the node.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;

use passage_core::crypto::{Eid, Identity};
use passage_core::wire::{COOKIE_MAGIC, HELLO_MAGIC, INITIATE_MAGIC, MESSAGE_MAGIC};

use crate::channel::{Channel, ChannelEvents};
use crate::dispatch::PacketDispatcher;
use crate::kex::{IncomingChannel, InitiatorIndex, Responder, MINUTE_KEY_ROTATION};
use crate::peer::{Peer, PeerContext};
use crate::receiver::MessageReceiver;
use crate::socket::{Inbound, Socket};

/// Stable identifier of one attached socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u32);

/// What a node reports to whoever drives it.
pub enum NodeEvent {
    /// A connect_channel round produced its first live channel.
    ChannelConnected {
        eid: Eid,
        channel: Arc<Channel>,
        events: ChannelEvents,
    },
    /// A connect_channel round died without producing any channel.
    ChannelFailed { eid: Eid },
    /// A remote initiator established a channel to us.
    IncomingChannel {
        eid: Eid,
        channel: Arc<Channel>,
        events: ChannelEvents,
    },
}

pub struct Node {
    identity: Arc<Identity>,
    dispatcher: Arc<PacketDispatcher>,
    receiver: Arc<MessageReceiver>,
    responder: Arc<Responder>,
    index: Arc<InitiatorIndex>,
    peers: DashMap<Eid, Arc<Peer>>,
    sockets: Mutex<Vec<(SocketId, Arc<dyn Socket>)>>,
    next_socket_id: AtomicU32,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Node {
    pub fn new(identity: Identity) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>) {
        let identity = Arc::new(identity);
        let dispatcher = Arc::new(PacketDispatcher::new());
        let receiver = MessageReceiver::new();
        let index = InitiatorIndex::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let responder = Responder::new(identity.clone(), receiver.clone(), incoming_tx);

        dispatcher
            .bind(HELLO_MAGIC, responder.clone())
            .expect("fresh dispatcher");
        dispatcher
            .bind(INITIATE_MAGIC, responder.clone())
            .expect("fresh dispatcher");
        dispatcher
            .bind(COOKIE_MAGIC, index.clone())
            .expect("fresh dispatcher");
        dispatcher
            .bind(MESSAGE_MAGIC, receiver.clone())
            .expect("fresh dispatcher");

        let node = Arc::new(Self {
            identity,
            dispatcher,
            receiver,
            responder,
            index,
            peers: DashMap::new(),
            sockets: Mutex::new(Vec::new()),
            next_socket_id: AtomicU32::new(0),
            events: events_tx,
        });

        node.spawn_incoming_pump(incoming_rx);
        node.spawn_minute_rotation();
        (node, events_rx)
    }

    /// Forward responder-accepted channels to the peer records and the
    /// event stream.
    fn spawn_incoming_pump(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<IncomingChannel>) {
        let weak: Weak<Node> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(accepted) = incoming.recv().await {
                let Some(node) = weak.upgrade() else {
                    return;
                };
                let IncomingChannel {
                    remote_eid,
                    channel,
                    events,
                } = accepted;
                node.peer(remote_eid).adopt_channel(channel.clone());
                let _ = node.events.send(NodeEvent::IncomingChannel {
                    eid: remote_eid,
                    channel,
                    events,
                });
            }
        });
    }

    fn spawn_minute_rotation(self: &Arc<Self>) {
        let responder = Arc::downgrade(&self.responder);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MINUTE_KEY_ROTATION);
            interval.tick().await; // the immediate first tick
            loop {
                interval.tick().await;
                let Some(responder) = responder.upgrade() else {
                    return;
                };
                responder.rotate_minute_key();
            }
        });
    }

    /// Attach a bound socket and start draining its inbound queue into
    /// the dispatcher.
    pub fn attach_socket(
        &self,
        socket: Arc<dyn Socket>,
        mut inbound: mpsc::Receiver<Inbound>,
    ) -> SocketId {
        let id = SocketId(self.next_socket_id.fetch_add(1, Ordering::SeqCst));
        self.sockets.lock().unwrap().push((id, socket.clone()));

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            while let Some((buf, src)) = inbound.recv().await {
                dispatcher.dispatch(&socket, buf, src);
            }
        });
        tracing::info!(socket = id.0, "socket attached");
        id
    }

    pub fn eid(&self) -> Eid {
        self.identity.eid()
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// The dispatcher, for services that bind additional magics (the
    /// rendezvous client's reply routing does).
    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    pub fn sockets(&self) -> Vec<(SocketId, Arc<dyn Socket>)> {
        self.sockets.lock().unwrap().clone()
    }

    /// The peer record for an identity, created on first reference.
    pub fn peer(&self, eid: Eid) -> Arc<Peer> {
        self.peers
            .entry(eid)
            .or_insert_with(|| {
                Peer::new(
                    eid,
                    PeerContext {
                        identity: self.identity.clone(),
                        receiver: self.receiver.clone(),
                        index: self.index.clone(),
                        events: self.events.clone(),
                    },
                )
            })
            .clone()
    }

    /// Initiate connection attempts to `eid` over every attached
    /// socket and known location.
    pub fn connect_channel(&self, eid: Eid) {
        self.peer(eid).connect_channel(self.sockets());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_records_are_created_once() {
        let (node, _events) = Node::new(Identity::generate());
        let eid = Identity::generate().eid();
        let a = node.peer(eid);
        let b = node.peer(eid);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn core_magics_are_bound() {
        let (node, _events) = Node::new(Identity::generate());
        // A second binding of any channel-protocol magic must fail —
        // the node already routed them.
        let receiver = MessageReceiver::new();
        for magic in [HELLO_MAGIC, COOKIE_MAGIC, INITIATE_MAGIC, MESSAGE_MAGIC] {
            assert!(node.dispatcher().bind(magic, receiver.clone()).is_err());
        }
    }
}
