//! Channel establishment scenarios: the four-message exchange under
//! clean links, cookie loss, and initiate replay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use passage_core::wire::{COOKIE_MAGIC, INITIATE_MAGIC};
use passage_node::sim::SimNetwork;
use passage_node::NodeEvent;
use passage_node::Socket;

use crate::{assert_quiet, ep, node_at, recv_event, scenario_link};

#[tokio::test(start_paused = true)]
async fn happy_path_connects_exactly_once() {
    let net = SimNetwork::new(scenario_link());
    let mut a = node_at(&net, "10.0.0.1:9660");
    let mut b = node_at(&net, "10.0.0.2:9660");

    a.node.peer(b.node.eid()).add_location_hint(b.addr);
    a.node.connect_channel(b.node.eid());

    let NodeEvent::ChannelConnected {
        eid,
        channel,
        mut events,
    } = recv_event(&mut a.events).await
    else {
        panic!("expected ChannelConnected");
    };
    assert_eq!(eid, b.node.eid());

    let NodeEvent::IncomingChannel {
        eid: from,
        channel: b_channel,
        events: mut b_events,
    } = recv_event(&mut b.events).await
    else {
        panic!("expected IncomingChannel");
    };
    assert_eq!(from, a.node.eid());

    // The established channel's remote key is exactly the short-term
    // key the responder allocated inside its cookie.
    assert_eq!(channel.remote_short_pk(), b_channel.local_short_pk());
    assert_eq!(channel.local_short_pk(), b_channel.remote_short_pk());

    // First application round trip decodes to the original bytes.
    channel.send_message(b"ping over the wire").unwrap();
    let delivered = b_events.incoming.recv().await.unwrap();
    assert_eq!(delivered.as_ref(), b"ping over the wire");

    b_channel.send_message(b"pong back").unwrap();
    let returned = events.incoming.recv().await.unwrap();
    assert_eq!(returned.as_ref(), b"pong back");

    // Exactly one completion on each side.
    assert_quiet(&mut a.events, Duration::from_secs(5)).await;
    assert_quiet(&mut b.events, Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn lost_cookie_recovers_via_hello_retransmit() {
    let net = SimNetwork::new(scenario_link());

    // Swallow the first COOKIE; everything after passes.
    let dropped = Arc::new(Mutex::new(false));
    let flag = dropped.clone();
    net.set_filter(Box::new(move |buf, _src, _dst| {
        if u64::from_le_bytes(buf[..8].try_into().unwrap()) == COOKIE_MAGIC {
            let mut dropped = flag.lock().unwrap();
            if !*dropped {
                *dropped = true;
                return false;
            }
        }
        true
    }));

    let mut a = node_at(&net, "10.0.0.1:9660");
    let mut b = node_at(&net, "10.0.0.2:9660");

    a.node.peer(b.node.eid()).add_location_hint(b.addr);
    a.node.connect_channel(b.node.eid());

    let NodeEvent::ChannelConnected { eid, .. } = recv_event(&mut a.events).await else {
        panic!("expected ChannelConnected after retransmit");
    };
    assert_eq!(eid, b.node.eid());
    assert!(*dropped.lock().unwrap(), "filter never saw a cookie");

    // Still exactly one completion.
    assert_quiet(&mut a.events, Duration::from_secs(5)).await;

    let NodeEvent::IncomingChannel { .. } = recv_event(&mut b.events).await else {
        panic!("expected IncomingChannel");
    };
    assert_quiet(&mut b.events, Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn replayed_initiate_is_rejected_after_key_rotation() {
    let net = SimNetwork::new(scenario_link());

    // Record every INITIATE that crosses the wire.
    let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let tap = captured.clone();
    net.set_filter(Box::new(move |buf, _src, _dst| {
        if u64::from_le_bytes(buf[..8].try_into().unwrap()) == INITIATE_MAGIC {
            tap.lock().unwrap().push(buf.to_vec());
        }
        true
    }));

    let mut a = node_at(&net, "10.0.0.1:9660");
    let mut b = node_at(&net, "10.0.0.2:9660");

    a.node.peer(b.node.eid()).add_location_hint(b.addr);
    a.node.connect_channel(b.node.eid());

    let NodeEvent::ChannelConnected { .. } = recv_event(&mut a.events).await else {
        panic!("expected ChannelConnected");
    };
    let NodeEvent::IncomingChannel {
        channel: b_channel, ..
    } = recv_event(&mut b.events).await
    else {
        panic!("expected IncomingChannel");
    };
    let initiate = captured.lock().unwrap().first().cloned().expect("captured initiate");
    net.clear_filter();

    // Free the short-term key so a successful replay *would* be able
    // to recreate the channel, then age the minute key out twice.
    b_channel.unbind();
    tokio::time::advance(Duration::from_secs(121)).await;

    // Replay the captured INITIATE from the initiator's address.
    let (raw, _rx) = net.host(ep("10.0.0.1:9660"));
    assert!(raw.send(ep("10.0.0.2:9660"), &initiate));

    // Silent rejection: no channel, no event, no ack.
    assert_quiet(&mut b.events, Duration::from_secs(10)).await;
}
