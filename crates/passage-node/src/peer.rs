//! Peer — per-remote-identity coordination.
//!
//! A peer record holds the endpoints a remote identity is believed to
//! be reachable at, the channels currently established to it, and the
//! key exchanges in flight. Duplicate attempts to the same
//! (socket, endpoint) pair are suppressed; multiple simultaneous
//! channels to one identity are allowed.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use passage_core::crypto::{Eid, Identity};

use crate::channel::Channel;
use crate::kex::{Initiator, InitiatorIndex, Outcome};
use crate::node::{NodeEvent, SocketId};
use crate::receiver::MessageReceiver;
use crate::socket::Socket;

// ── Endpoint affinity ─────────────────────────────────────────────────────────

/// XOR distance between two addresses; addresses of different families
/// are infinitely far apart.
fn affinity_distance(local: IpAddr, candidate: IpAddr) -> u128 {
    match (local, candidate) {
        (IpAddr::V4(a), IpAddr::V4(b)) => (u32::from(a) ^ u32::from(b)) as u128,
        (IpAddr::V6(a), IpAddr::V6(b)) => u128::from(a) ^ u128::from(b),
        _ => u128::MAX,
    }
}

/// Order candidate endpoints by XOR affinity to a local address, so
/// multi-homed hosts try topologically near endpoints first.
pub fn sorted_by_affinity(
    endpoints: impl IntoIterator<Item = SocketAddr>,
    local: IpAddr,
) -> Vec<SocketAddr> {
    let mut out: Vec<SocketAddr> = endpoints.into_iter().collect();
    out.sort_by_key(|ep| affinity_distance(local, ep.ip()));
    out
}

// ── Peer ──────────────────────────────────────────────────────────────────────

/// Capabilities a peer needs from its host — no back-pointer to the
/// host itself.
#[derive(Clone)]
pub struct PeerContext {
    pub identity: Arc<Identity>,
    pub receiver: Arc<MessageReceiver>,
    pub index: Arc<InitiatorIndex>,
    pub events: mpsc::UnboundedSender<NodeEvent>,
}

pub struct Peer {
    eid: Eid,
    ctx: PeerContext,
    /// Candidate endpoints: rendezvous lookups, hints, observed sources.
    locations: Mutex<BTreeSet<SocketAddr>>,
    /// Established channels keyed by the remote short-term key.
    channels: DashMap<[u8; 32], Arc<Channel>>,
    /// In-flight exchanges keyed by (socket, endpoint); value cancels.
    initiated: Mutex<HashMap<(SocketId, SocketAddr), oneshot::Sender<()>>>,
    connected_reported: AtomicBool,
    failed_reported: AtomicBool,
}

impl Peer {
    pub fn new(eid: Eid, ctx: PeerContext) -> Arc<Self> {
        Arc::new(Self {
            eid,
            ctx,
            locations: Mutex::new(BTreeSet::new()),
            channels: DashMap::new(),
            initiated: Mutex::new(HashMap::new()),
            connected_reported: AtomicBool::new(false),
            failed_reported: AtomicBool::new(false),
        })
    }

    pub fn eid(&self) -> Eid {
        self.eid
    }

    /// Supply an endpoint that may be useful for reaching this peer.
    pub fn add_location_hint(&self, ep: SocketAddr) {
        self.locations.lock().unwrap().insert(ep);
    }

    pub fn locations(&self) -> Vec<SocketAddr> {
        self.locations.lock().unwrap().iter().copied().collect()
    }

    /// Channels currently established to this peer.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    /// Record a channel the responder side accepted from this peer.
    pub fn adopt_channel(&self, channel: Arc<Channel>) {
        self.locations
            .lock()
            .unwrap()
            .insert(channel.remote_endpoint());
        self.channels
            .insert(*channel.remote_short_pk(), channel);
    }

    /// Try to establish a channel by every means available: each known
    /// endpoint through each active socket, near endpoints first.
    /// Exactly one of `ChannelConnected` or `ChannelFailed` follows.
    pub fn connect_channel(self: &Arc<Self>, sockets: Vec<(SocketId, Arc<dyn Socket>)>) {
        self.connected_reported.store(false, Ordering::SeqCst);
        self.failed_reported.store(false, Ordering::SeqCst);

        let locations = self.locations();
        let mut started = 0usize;
        for (socket_id, socket) in sockets {
            let local_ip = socket
                .local_endpoints()
                .first()
                .map(|ep| ep.ip())
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
            for ep in sorted_by_affinity(locations.iter().copied(), local_ip) {
                if self.initiate_key_exchange(socket_id, socket.clone(), ep) {
                    started += 1;
                }
            }
        }

        if started == 0 && self.initiated.lock().unwrap().is_empty() {
            self.report_failed();
        }
    }

    /// Start one exchange unless that (socket, endpoint) pair already
    /// has one in flight. Returns whether an attempt was started.
    fn initiate_key_exchange(
        self: &Arc<Self>,
        socket_id: SocketId,
        socket: Arc<dyn Socket>,
        ep: SocketAddr,
    ) -> bool {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut initiated = self.initiated.lock().unwrap();
            if initiated.contains_key(&(socket_id, ep)) {
                tracing::debug!(%ep, "exchange already in flight, suppressing duplicate");
                return false;
            }
            initiated.insert((socket_id, ep), cancel_tx);
        }

        let peer = self.clone();
        let initiator = Initiator {
            target: ep,
            remote_eid: self.eid,
            identity: self.ctx.identity.clone(),
            socket,
            receiver: self.ctx.receiver.clone(),
            index: self.ctx.index.clone(),
            payload: Vec::new(),
        };
        tokio::spawn(async move {
            let outcome = initiator.run(cancel_rx).await;
            peer.completed(socket_id, ep, outcome);
        });
        true
    }

    /// Terminal handling for one attempt.
    fn completed(&self, socket_id: SocketId, ep: SocketAddr, outcome: Outcome) {
        let remaining = {
            let mut initiated = self.initiated.lock().unwrap();
            initiated.remove(&(socket_id, ep));
            initiated.len()
        };

        match outcome {
            Outcome::Established { channel, events } => {
                self.locations.lock().unwrap().insert(ep);
                self.channels
                    .insert(*channel.remote_short_pk(), channel.clone());
                if !self.connected_reported.swap(true, Ordering::SeqCst) {
                    let _ = self.ctx.events.send(NodeEvent::ChannelConnected {
                        eid: self.eid,
                        channel,
                        events,
                    });
                }
            }
            Outcome::Failed => {
                if remaining == 0 && !self.connected_reported.load(Ordering::SeqCst) {
                    self.report_failed();
                }
            }
            Outcome::Cancelled => {}
        }
    }

    /// Cancel every in-flight exchange without completion reports.
    pub fn cancel_exchanges(&self) {
        let cancels: Vec<_> = {
            let mut initiated = self.initiated.lock().unwrap();
            initiated.drain().map(|(_, tx)| tx).collect()
        };
        for cancel in cancels {
            let _ = cancel.send(());
        }
    }

    fn report_failed(&self) {
        if !self.failed_reported.swap(true, Ordering::SeqCst) {
            let _ = self
                .ctx
                .events
                .send(NodeEvent::ChannelFailed { eid: self.eid });
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.initiated.lock().unwrap().len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSocket(SocketAddr);

    impl Socket for NullSocket {
        fn send(&self, _dst: SocketAddr, _buf: &[u8]) -> bool {
            true
        }
        fn local_endpoints(&self) -> Vec<SocketAddr> {
            vec![self.0]
        }
    }

    fn context() -> (PeerContext, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PeerContext {
                identity: Arc::new(Identity::generate()),
                receiver: MessageReceiver::new(),
                index: InitiatorIndex::new(),
                events: tx,
            },
            rx,
        )
    }

    #[test]
    fn affinity_prefers_shared_prefixes() {
        // The gateway fixture: addresses near our own sort first, the
        // loopback and distant nets sort later, other families last.
        let local: IpAddr = "85.253.73.240".parse().unwrap();
        let eps: Vec<SocketAddr> = [
            "127.0.0.1:1024",
            "8.8.8.8:1024",
            "85.253.73.1:1024",
            "85.253.73.254:1024",
            "[::1]:1024",
            "10.0.0.1:1024",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();

        let sorted = sorted_by_affinity(eps, local);
        assert_eq!(sorted[0], "85.253.73.254:1024".parse::<SocketAddr>().unwrap());
        assert_eq!(sorted[1], "85.253.73.1:1024".parse::<SocketAddr>().unwrap());
        // IPv6 is incomparable and lands at the very end.
        assert_eq!(*sorted.last().unwrap(), "[::1]:1024".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn affinity_families_do_not_mix() {
        let local: IpAddr = "::1".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:1024".parse().unwrap();
        let v6_far: SocketAddr = "[fe80::ffff]:1024".parse().unwrap();
        let sorted = sorted_by_affinity([v4, v6_far], local);
        assert_eq!(sorted[0], v6_far);
        assert_eq!(sorted[1], v4);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_attempts_are_suppressed() {
        let (ctx, _rx) = context();
        let index = ctx.index.clone();
        let peer = Peer::new(Identity::generate().eid(), ctx);
        peer.add_location_hint("10.0.0.2:9660".parse().unwrap());

        let socket: Arc<dyn Socket> =
            Arc::new(NullSocket("10.0.0.1:9660".parse().unwrap()));
        let sockets = vec![(SocketId(0), socket)];

        peer.connect_channel(sockets.clone());
        peer.connect_channel(sockets);
        tokio::task::yield_now().await;

        // One (socket, endpoint) pair — at most one initiator, however
        // many times connect was called.
        assert_eq!(peer.in_flight(), 1);
        assert_eq!(index.len(), 1);

        peer.cancel_exchanges();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reported_once_when_all_attempts_die() {
        let (ctx, mut rx) = context();
        let peer = Peer::new(Identity::generate().eid(), ctx);
        peer.add_location_hint("10.0.0.2:9660".parse().unwrap());

        let socket: Arc<dyn Socket> =
            Arc::new(NullSocket("10.0.0.1:9660".parse().unwrap()));
        peer.connect_channel(vec![(SocketId(0), socket)]);

        // No responder exists; the attempt burns its budget and fails.
        let event = loop {
            tokio::task::yield_now().await;
            if let Ok(e) = rx.try_recv() {
                break e;
            }
            tokio::time::advance(std::time::Duration::from_secs(2)).await;
        };
        assert!(matches!(event, NodeEvent::ChannelFailed { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_endpoints_fails_immediately() {
        let (ctx, mut rx) = context();
        let peer = Peer::new(Identity::generate().eid(), ctx);

        let socket: Arc<dyn Socket> =
            Arc::new(NullSocket("10.0.0.1:9660".parse().unwrap()));
        peer.connect_channel(vec![(SocketId(0), socket)]);

        assert!(matches!(
            rx.try_recv().unwrap(),
            NodeEvent::ChannelFailed { .. }
        ));
    }
}
