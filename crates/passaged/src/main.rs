//! passaged — Passage node daemon.
//!
//! Brings up the channel socket, registers at the configured
//! rendezvous servers, and logs channel and registration events.
//! RUST_LOG controls verbosity, e.g. RUST_LOG=debug passaged.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use passage_core::config::{split_server_entry, NodeConfig};
use passage_core::crypto::Identity;
use passage_node::socket::Socket;
use passage_node::{Node, NodeEvent, UdpTransport};
use passage_rendezvous::{ClientEvent, ClientHandle, RegistrationClient, RoutingReceiver};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = NodeConfig::write_default_if_missing().context("writing default config")?;
    let config = NodeConfig::load().context("loading config")?;
    tracing::info!(config = %config_path.display(), "passaged starting");

    let identity =
        Identity::load_or_generate(&config.identity.seed_path).context("loading identity")?;
    tracing::info!(eid = %hex::encode(identity.eid()), "host identity");

    let (node, mut node_events) = Node::new(identity);

    let listen: SocketAddr = format!(
        "{}:{}",
        config.network.listen, config.network.channel_port
    )
    .parse()
    .context("bad listen address")?;
    let (socket, inbound) = UdpTransport::bind(listen)
        .await
        .context("binding channel socket")?;
    tracing::info!(%listen, "channel socket bound");
    node.attach_socket(socket, inbound);

    // One registration client per configured rendezvous server, all
    // sharing the node's reply routing.
    let mut reg_handles: Vec<ClientHandle> = Vec::new();
    if !config.rendezvous.servers.is_empty() {
        let routing = RoutingReceiver::bind(node.dispatcher())
            .map_err(|e| anyhow::anyhow!("binding rendezvous reply magics: {e}"))?;
        let sockets: Vec<Arc<dyn Socket>> =
            node.sockets().into_iter().map(|(_, s)| s).collect();
        let profile = config.profile.to_profile();

        for server in &config.rendezvous.servers {
            let (host, port) = split_server_entry(server);
            tracing::info!(server = %host, port, "registering at rendezvous server");
            let (client, handle, mut events) = RegistrationClient::new(
                node.identity().clone(),
                &profile,
                host.clone(),
                port,
                config.rendezvous.persist,
                sockets.clone(),
                routing.clone(),
            );
            reg_handles.push(handle);
            tokio::spawn(client.run());
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        ClientEvent::Ready {
                            lifetime,
                            public_ep,
                        } => {
                            tracing::info!(server = %host, %public_ep, ?lifetime, "registered");
                        }
                        ClientEvent::Disconnected { error } => {
                            tracing::warn!(server = %host, error, "registration lost");
                        }
                        ClientEvent::LookupDone { target, ep, .. } => {
                            tracing::info!(
                                dst = %hex::encode(&target[..4]),
                                ep = ?ep,
                                "lookup finished"
                            );
                        }
                        ClientEvent::LookupNotify { origin, ep, .. } => {
                            tracing::info!(
                                origin = %hex::encode(&origin[..4]),
                                %ep,
                                "peer is looking for us"
                            );
                        }
                        ClientEvent::SearchDone {
                            text,
                            ids,
                            complete,
                        } => {
                            tracing::info!(text, results = ids.len(), complete, "search finished");
                        }
                    }
                }
            });
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                // Best-effort deletes so our records do not linger the
                // full hour.
                for handle in &reg_handles {
                    handle.disconnect();
                }
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                return Ok(());
            }

            maybe = node_events.recv() => {
                let Some(event) = maybe else { return Ok(()) };
                match event {
                    NodeEvent::ChannelConnected { eid, channel, .. } => {
                        tracing::info!(
                            peer = %hex::encode(&eid[..4]),
                            remote = %channel.remote_endpoint(),
                            "channel connected"
                        );
                    }
                    NodeEvent::ChannelFailed { eid } => {
                        tracing::warn!(peer = %hex::encode(&eid[..4]), "channel attempt failed");
                    }
                    NodeEvent::IncomingChannel { eid, channel, .. } => {
                        tracing::info!(
                            peer = %hex::encode(&eid[..4]),
                            remote = %channel.remote_endpoint(),
                            "incoming channel"
                        );
                    }
                }
            }
        }
    }
}
