//! Passage integration harness.
//!
//! Scenarios run two or more simulated hosts on the in-memory network
//! under a paused tokio clock, so every test is a deterministic
//! discrete-event simulation: retransmit timers, minute-key rotation,
//! and re-registration intervals all run in virtual time.

mod channels;
mod rendezvous;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use passage_core::crypto::Identity;
use passage_node::sim::{LinkParams, SimNetwork};
use passage_node::{Node, NodeEvent};

pub fn ep(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// The scenario link: 10 Mbps with 10 ms one-way delay.
pub fn scenario_link() -> LinkParams {
    LinkParams::eth_10().with_delay(Duration::from_millis(10))
}

pub struct SimHost {
    pub node: Arc<Node>,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
    pub addr: SocketAddr,
}

/// Bring up a node with a fresh identity on one simulated endpoint.
pub fn node_at(net: &Arc<SimNetwork>, addr: &str) -> SimHost {
    let (node, events) = Node::new(Identity::generate());
    let addr = ep(addr);
    let (socket, inbound) = net.host(addr);
    node.attach_socket(socket, inbound);
    SimHost { node, events, addr }
}

/// Wait for the next node event, bounded in virtual time.
pub async fn recv_event(events: &mut mpsc::UnboundedReceiver<NodeEvent>) -> NodeEvent {
    tokio::time::timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("timed out waiting for node event")
        .expect("event stream closed")
}

/// Assert that no further node event arrives within `window` of
/// virtual time.
pub async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<NodeEvent>, window: Duration) {
    if let Ok(Some(_)) = tokio::time::timeout(window, events.recv()).await {
        panic!("expected no further node events");
    }
}
