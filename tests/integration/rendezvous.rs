//! Rendezvous scenarios: registration, keyword search, hole-punch
//! notification, and the NAT-keepalive re-registration cadence.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use passage_core::crypto::{Eid, Identity};
use passage_core::profile::PeerProfile;
use passage_core::wire::REGSERVER_PORT;
use passage_node::sim::SimNetwork;
use passage_node::socket::Socket;
use passage_rendezvous::proto::{
    dispatch_magic, OP_INSERT1, OP_INSERT2, REG_REQUEST,
};
use passage_rendezvous::{
    ClientEvent, ClientHandle, RegistrationClient, RegistrationServer, RoutingReceiver,
};

use crate::{ep, node_at, scenario_link, SimHost};

const SERVER_ADDR: &str = "10.0.0.100:9669";

/// Spawn a registration server on the simulated network.
fn regserver_at(net: &Arc<SimNetwork>, addr: &str) {
    assert_eq!(ep(addr).port(), REGSERVER_PORT);
    let (socket, inbound) = net.host(ep(addr));
    let server = RegistrationServer::new(Identity::generate());
    tokio::spawn(server.run(socket, inbound));
}

/// Attach a registration client to a node, pointed at the server.
fn reg_client(
    host: &SimHost,
    profile: PeerProfile,
) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let routing = RoutingReceiver::bind(host.node.dispatcher()).expect("reply magics free");
    let sockets: Vec<Arc<dyn Socket>> = host.node.sockets().into_iter().map(|(_, s)| s).collect();
    let (client, handle, events) = RegistrationClient::new(
        host.node.identity().clone(),
        &profile,
        ep(SERVER_ADDR).ip().to_string(),
        REGSERVER_PORT,
        true,
        sockets,
        routing,
    );
    tokio::spawn(client.run());
    (handle, events)
}

async fn wait_ready(events: &mut mpsc::UnboundedReceiver<ClientEvent>) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("timed out waiting for registration")
            .expect("client events closed");
        if let ClientEvent::Ready { .. } = event {
            return;
        }
    }
}

fn boston_profile() -> PeerProfile {
    let mut p = PeerProfile::new();
    p.set_host_name("alpha");
    p.set_city("Boston");
    p
}

#[tokio::test(start_paused = true)]
async fn registration_and_keyword_search() {
    let net = SimNetwork::new(scenario_link());
    regserver_at(&net, SERVER_ADDR);

    let a = node_at(&net, "10.0.0.1:9660");
    let b = node_at(&net, "10.0.0.2:9660");

    let (_a_handle, mut a_events) = reg_client(&a, boston_profile());
    wait_ready(&mut a_events).await;

    let (b_handle, mut b_events) = reg_client(&b, PeerProfile::new());
    wait_ready(&mut b_events).await;

    b_handle.search("Boston");
    let event = tokio::time::timeout(Duration::from_secs(30), b_events.recv())
        .await
        .expect("search timed out")
        .unwrap();
    let ClientEvent::SearchDone {
        text,
        ids,
        complete,
    } = event
    else {
        panic!("expected SearchDone, got {event:?}");
    };
    assert_eq!(text, "Boston");
    assert!(complete);
    assert_eq!(ids, vec![a.node.eid()]);
}

#[tokio::test(start_paused = true)]
async fn lookup_with_notify_punches_both_ways() {
    let net = SimNetwork::new(scenario_link());
    regserver_at(&net, SERVER_ADDR);

    let a = node_at(&net, "10.0.0.1:9660");
    let b = node_at(&net, "10.0.0.2:9660");

    let (_a_handle, mut a_events) = reg_client(&a, boston_profile());
    wait_ready(&mut a_events).await;
    let (b_handle, mut b_events) = reg_client(&b, PeerProfile::new());
    wait_ready(&mut b_events).await;

    b_handle.lookup(a.node.eid(), true);

    // B learns A's registered endpoint and profile.
    let event = tokio::time::timeout(Duration::from_secs(30), b_events.recv())
        .await
        .expect("lookup timed out")
        .unwrap();
    let ClientEvent::LookupDone {
        target,
        ep: found,
        profile,
    } = event
    else {
        panic!("expected LookupDone, got {event:?}");
    };
    assert_eq!(target, a.node.eid());
    assert_eq!(found, Some(a.addr));
    assert_eq!(profile.unwrap().city(), Some("Boston"));

    // A hears that B is looking — the other half of the hole punch.
    let event = tokio::time::timeout(Duration::from_secs(30), a_events.recv())
        .await
        .expect("notify timed out")
        .unwrap();
    let ClientEvent::LookupNotify { origin, ep: from, .. } = event else {
        panic!("expected LookupNotify, got {event:?}");
    };
    assert_eq!(origin, b.node.eid());
    assert_eq!(from, b.addr);
}

#[tokio::test(start_paused = true)]
async fn lookup_of_unknown_target_answers_negatively() {
    let net = SimNetwork::new(scenario_link());
    regserver_at(&net, SERVER_ADDR);

    let a = node_at(&net, "10.0.0.1:9660");
    let (a_handle, mut a_events) = reg_client(&a, PeerProfile::new());
    wait_ready(&mut a_events).await;

    let ghost: Eid = [0x99; 32];
    a_handle.lookup(ghost, false);

    let event = tokio::time::timeout(Duration::from_secs(30), a_events.recv())
        .await
        .expect("negative lookup timed out")
        .unwrap();
    let ClientEvent::LookupDone { target, ep: found, .. } = event else {
        panic!("expected LookupDone, got {event:?}");
    };
    assert_eq!(target, ghost);
    assert_eq!(found, None);
}

#[tokio::test(start_paused = true)]
async fn reregistration_happens_on_the_nat_keepalive_cadence() {
    let net = SimNetwork::new(scenario_link());

    // Count INSERT1/INSERT2 requests crossing the wire.
    let counts: Arc<Mutex<(u32, u32)>> = Arc::new(Mutex::new((0, 0)));
    let tap = counts.clone();
    let insert1_magic = dispatch_magic(REG_REQUEST | OP_INSERT1);
    let insert2_magic = dispatch_magic(REG_REQUEST | OP_INSERT2);
    net.set_filter(Box::new(move |buf, _src, _dst| {
        let magic = u64::from_le_bytes(buf[..8].try_into().unwrap());
        let mut counts = tap.lock().unwrap();
        if magic == insert1_magic {
            counts.0 += 1;
        } else if magic == insert2_magic {
            counts.1 += 1;
        }
        true
    }));

    regserver_at(&net, SERVER_ADDR);
    let a = node_at(&net, "10.0.0.1:9660");
    let (_handle, mut events) = reg_client(&a, boston_profile());
    wait_ready(&mut events).await;

    assert_eq!(*counts.lock().unwrap(), (1, 1), "initial registration");

    // A 3600 s lifetime re-registers at min(lifetime/2, 15 min).
    tokio::time::advance(Duration::from_secs(15 * 60 + 5)).await;
    wait_ready(&mut events).await;

    assert_eq!(
        *counts.lock().unwrap(),
        (2, 2),
        "exactly one re-registration pair after 15 minutes"
    );
}
