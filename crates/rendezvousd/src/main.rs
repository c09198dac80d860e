//! rendezvousd — Passage registration server daemon.
//!
//! Listens on the registration port and serves the directory. The
//! listen address comes from the first argument, default 0.0.0.0:9669.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

use passage_core::crypto::Identity;
use passage_core::wire::REGSERVER_PORT;
use passage_node::UdpTransport;
use passage_rendezvous::RegistrationServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listen: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("0.0.0.0:{REGSERVER_PORT}"))
        .parse()
        .context("bad listen address")?;

    // The server identity only keys its challenge cookies, but keeping
    // it stable across restarts keeps cookies stable too.
    let seed_path = std::env::var("RENDEZVOUSD_IDENTITY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/passage/rendezvousd-identity"));
    let identity = match Identity::load_or_generate(&seed_path) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(error = %e, "identity not persistable, using an ephemeral one");
            Identity::generate()
        }
    };
    tracing::info!(eid = %hex::encode(identity.eid()), "server identity");

    let (socket, inbound) = UdpTransport::bind(listen)
        .await
        .context("binding registration socket")?;
    tracing::info!(%listen, "registration socket bound");

    RegistrationServer::new(identity).run(socket, inbound).await;
    Ok(())
}
