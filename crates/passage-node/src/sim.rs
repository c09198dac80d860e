//! In-memory simulated network for tests.
//!
//! Hosts register sockets by endpoint; datagrams travel through links
//! with configurable bandwidth, one-way delay, and loss. Delivery rides
//! `tokio::time::sleep_until`, so under a paused-clock runtime the whole
//! network becomes a discrete-event simulation: the clock jumps from
//! packet arrival to timer fire with no wall-time in between.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::socket::{Inbound, Socket, INBOUND_QUEUE};

/// Link characteristics for one direction of a connection.
#[derive(Debug, Clone, Copy)]
pub struct LinkParams {
    /// Bandwidth in bytes per second.
    pub rate: u64,
    /// One-way propagation delay.
    pub delay: Duration,
    /// Random loss rate, 0.0 (reliable) to 1.0 (black hole).
    pub loss: f64,
}

impl LinkParams {
    /// 10 Mbps Ethernet link.
    pub fn eth_10() -> Self {
        Self {
            rate: 1_250_000,
            delay: Duration::from_millis(1),
            loss: 0.0,
        }
    }

    /// 100 Mbps Ethernet link.
    pub fn eth_100() -> Self {
        Self {
            rate: 12_500_000,
            delay: Duration::from_millis(1),
            loss: 0.0,
        }
    }

    /// 10 Mbps satellite link with a painful delay.
    pub fn sat_10() -> Self {
        Self {
            rate: 1_250_000,
            delay: Duration::from_millis(500),
            loss: 0.0,
        }
    }

    /// 802.11g WiFi link.
    pub fn wifi_54() -> Self {
        Self {
            rate: 6_750_000,
            delay: Duration::from_millis(3),
            loss: 0.005,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = loss;
        self
    }
}

/// Deterministic drop hook: return false to swallow a datagram.
/// Receives (payload, source, destination).
pub type Filter = Box<dyn FnMut(&[u8], SocketAddr, SocketAddr) -> bool + Send>;

pub struct SimNetwork {
    hosts: Mutex<HashMap<SocketAddr, mpsc::Sender<Inbound>>>,
    links: Mutex<HashMap<(SocketAddr, SocketAddr), LinkParams>>,
    default_link: Mutex<LinkParams>,
    /// Tail of the transmit queue per directed link, so back-to-back
    /// datagrams serialize instead of arriving simultaneously.
    queue_tails: Mutex<HashMap<(SocketAddr, SocketAddr), Instant>>,
    filter: Mutex<Option<Filter>>,
}

impl SimNetwork {
    pub fn new(default_link: LinkParams) -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            default_link: Mutex::new(default_link),
            queue_tails: Mutex::new(HashMap::new()),
            filter: Mutex::new(None),
        })
    }

    /// Register a host socket at `addr`.
    pub fn host(self: &Arc<Self>, addr: SocketAddr) -> (Arc<SimSocket>, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.hosts.lock().unwrap().insert(addr, tx);
        (
            Arc::new(SimSocket {
                net: self.clone(),
                local: addr,
            }),
            rx,
        )
    }

    /// Override link characteristics between two endpoints, both
    /// directions.
    pub fn set_link(&self, a: SocketAddr, b: SocketAddr, params: LinkParams) {
        let mut links = self.links.lock().unwrap();
        links.insert((a, b), params);
        links.insert((b, a), params);
    }

    /// Install a deterministic drop hook (replacing any previous one).
    pub fn set_filter(&self, filter: Filter) {
        *self.filter.lock().unwrap() = Some(filter);
    }

    pub fn clear_filter(&self) {
        *self.filter.lock().unwrap() = None;
    }

    fn params_for(&self, src: SocketAddr, dst: SocketAddr) -> LinkParams {
        self.links
            .lock()
            .unwrap()
            .get(&(src, dst))
            .copied()
            .unwrap_or(*self.default_link.lock().unwrap())
    }
}

/// One host's socket on the simulated network.
pub struct SimSocket {
    net: Arc<SimNetwork>,
    local: SocketAddr,
}

impl Socket for SimSocket {
    fn send(&self, dst: SocketAddr, buf: &[u8]) -> bool {
        // Deterministic drops first, so tests can target one packet.
        if let Some(filter) = self.net.filter.lock().unwrap().as_mut() {
            if !filter(buf, self.local, dst) {
                tracing::trace!(src = %self.local, %dst, "sim filter dropped datagram");
                return true;
            }
        }

        let params = self.net.params_for(self.local, dst);
        if params.loss > 0.0 && rand::random::<f64>() < params.loss {
            return true;
        }

        let Some(tx) = self.net.hosts.lock().unwrap().get(&dst).cloned() else {
            return false;
        };

        // Serialization time on the link plus propagation delay; the
        // transmit queue keeps per-link ordering.
        let now = Instant::now();
        let transmit = Duration::from_secs_f64(buf.len() as f64 / params.rate as f64);
        let arrival = {
            let mut tails = self.net.queue_tails.lock().unwrap();
            let tail = tails.entry((self.local, dst)).or_insert(now);
            let start = (*tail).max(now);
            *tail = start + transmit;
            start + transmit + params.delay
        };

        let data = Bytes::copy_from_slice(buf);
        let src = self.local;
        tokio::spawn(async move {
            tokio::time::sleep_until(arrival).await;
            let _ = tx.send((data, src)).await;
        });
        true
    }

    fn local_endpoints(&self) -> Vec<SocketAddr> {
        vec![self.local]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeEvent};
    use passage_core::crypto::Identity;

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_respects_link_delay() {
        let net = SimNetwork::new(LinkParams::eth_10().with_delay(Duration::from_millis(10)));
        let (a, _arx) = net.host(ep("10.0.0.1:9660"));
        let (_b, mut brx) = net.host(ep("10.0.0.2:9660"));

        let start = Instant::now();
        assert!(a.send(ep("10.0.0.2:9660"), &[0u8; 64]));
        let (buf, src) = brx.recv().await.unwrap();

        assert_eq!(buf.len(), 64);
        assert_eq!(src, ep("10.0.0.1:9660"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(10), "arrived too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(50), "arrived too late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_unknown_host_fails() {
        let net = SimNetwork::new(LinkParams::eth_100());
        let (a, _arx) = net.host(ep("10.0.0.1:9660"));
        assert!(!a.send(ep("10.0.0.9:9660"), &[0u8; 64]));
    }

    /// Whole-stack smoke test: two nodes on a simulated link complete
    /// the hello/cookie/initiate exchange and trade a message.
    #[tokio::test(start_paused = true)]
    async fn two_nodes_establish_a_channel() {
        let net = SimNetwork::new(LinkParams::eth_10().with_delay(Duration::from_millis(10)));

        let (node_a, mut events_a) = Node::new(Identity::generate());
        let (node_b, mut events_b) = Node::new(Identity::generate());

        let (sock_a, rx_a) = net.host(ep("10.0.0.1:9660"));
        let (sock_b, rx_b) = net.host(ep("10.0.0.2:9660"));
        node_a.attach_socket(sock_a, rx_a);
        node_b.attach_socket(sock_b, rx_b);

        let peer = node_a.peer(node_b.eid());
        peer.add_location_hint(ep("10.0.0.2:9660"));
        node_a.connect_channel(node_b.eid());

        let NodeEvent::ChannelConnected { eid, channel, .. } = events_a.recv().await.unwrap()
        else {
            panic!("expected ChannelConnected");
        };
        assert_eq!(eid, node_b.eid());

        let NodeEvent::IncomingChannel {
            eid: incoming_eid,
            events: mut b_chan_events,
            ..
        } = events_b.recv().await.unwrap()
        else {
            panic!("expected IncomingChannel");
        };
        assert_eq!(incoming_eid, node_a.eid());

        channel.send_message(b"first application bytes").unwrap();
        let delivered = b_chan_events.incoming.recv().await.unwrap();
        assert_eq!(delivered.as_ref(), b"first application bytes");
    }
}
