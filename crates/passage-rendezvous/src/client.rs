//! Registration client — keeps one host registered at one rendezvous
//! server and drives lookups, searches, and the final delete.
//!
//! State machine: resolve → insert1 → insert2 → registered, with
//! backoff retransmission at every step. Persistent clients never give
//! up on transport trouble; they fall back to resolve and work forward
//! again. Re-registration happens at half the granted lifetime, capped
//! at 15 minutes — most NATs drop idle UDP mappings around then.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use passage_core::crypto::{self, Eid, Hasher, Identity};
use passage_core::profile::PeerProfile;
use passage_node::dispatch::{DispatchError, PacketDispatcher, PacketReceiver};
use passage_node::socket::Socket;

use crate::proto::{dispatch_magic, response_nonce, Request, Response, CLIENT_CODES};

const RETRANSMIT_INITIAL: Duration = Duration::from_secs(1);
const RETRANSMIT_FACTOR: f64 = 1.5;
const MAX_ATTEMPTS: u32 = 5;
const RESOLVE_RETRY: Duration = Duration::from_secs(10);

/// Ceiling on the re-registration interval, under any granted lifetime.
pub const REREGISTER_MAX: Duration = Duration::from_secs(15 * 60);

// ── Reply routing ─────────────────────────────────────────────────────────────

/// Routes rendezvous replies arriving on a node's sockets to the
/// client that owns the hashed nonce they lead with. One receiver per
/// node, bound to all six reply magics.
pub struct RoutingReceiver {
    by_nonce: DashMap<[u8; 32], mpsc::UnboundedSender<Bytes>>,
}

impl RoutingReceiver {
    pub fn bind(dispatcher: &PacketDispatcher) -> Result<Arc<Self>, DispatchError> {
        let receiver = Arc::new(Self {
            by_nonce: DashMap::new(),
        });
        for code in CLIENT_CODES {
            dispatcher.bind(dispatch_magic(code), receiver.clone())?;
        }
        Ok(receiver)
    }

    /// A receiver not bound to any dispatcher, for driving directly.
    pub fn unbound() -> Arc<Self> {
        Arc::new(Self {
            by_nonce: DashMap::new(),
        })
    }

    pub fn register(&self, nonce: [u8; 32], tx: mpsc::UnboundedSender<Bytes>) {
        self.by_nonce.insert(nonce, tx);
    }

    pub fn unregister(&self, nonce: &[u8; 32]) {
        self.by_nonce.remove(nonce);
    }
}

impl PacketReceiver for RoutingReceiver {
    fn receive(&self, _socket: &Arc<dyn Socket>, buf: Bytes, _src: SocketAddr) {
        let Some(nonce) = response_nonce(&buf) else {
            return;
        };
        match self.by_nonce.get(&nonce) {
            Some(tx) => {
                let _ = tx.send(buf);
            }
            None => {
                tracing::trace!("rendezvous reply for unknown nonce");
            }
        }
    }
}

/// Unregisters a nonce when a registration round ends.
struct NonceGuard {
    routing: Arc<RoutingReceiver>,
    nonce: [u8; 32],
}

impl Drop for NonceGuard {
    fn drop(&mut self) {
        self.routing.unregister(&self.nonce);
    }
}

// ── Events and commands ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ClientEvent {
    /// Registered; re-registration is scheduled internally.
    Ready {
        lifetime: Duration,
        public_ep: SocketAddr,
    },
    /// Registration ended (voluntarily or not). Terminal for
    /// non-persistent clients.
    Disconnected { error: String },
    /// A lookup finished; `ep` is None when the target is unknown.
    LookupDone {
        target: Eid,
        ep: Option<SocketAddr>,
        profile: Option<PeerProfile>,
    },
    /// Someone looked us up with notify set — their half of a hole punch.
    LookupNotify {
        origin: Eid,
        ep: SocketAddr,
        profile: Option<PeerProfile>,
    },
    SearchDone {
        text: String,
        ids: Vec<Eid>,
        complete: bool,
    },
}

enum Command {
    Lookup { target: Eid, notify: bool },
    Search(String),
    Disconnect,
}

/// Handle for issuing requests to a running client.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    /// Look up a peer; with `notify`, ask the server to tell the peer
    /// about us too (bidirectional hole punch).
    pub fn lookup(&self, target: Eid, notify: bool) {
        let _ = self.commands.send(Command::Lookup { target, notify });
    }

    pub fn search(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::Search(text.into()));
    }

    /// Best-effort delete and shut the client down.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

enum Phase {
    Insert1,
    Insert2,
    Registered,
}

pub struct RegistrationClient {
    identity: Arc<Identity>,
    profile_blob: Vec<u8>,
    server_host: String,
    server_port: u16,
    persist: bool,
    sockets: Vec<Arc<dyn Socket>>,
    routing: Arc<RoutingReceiver>,
    events: mpsc::UnboundedSender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl RegistrationClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Identity>,
        profile: &PeerProfile,
        server_host: String,
        server_port: u16,
        persist: bool,
        sockets: Vec<Arc<dyn Socket>>,
        routing: Arc<RoutingReceiver>,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            Self {
                identity,
                profile_blob: profile.encode(),
                server_host,
                server_port,
                persist,
                sockets,
                routing,
                events: events_tx,
                commands: commands_rx,
            },
            ClientHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    /// Drive registration until disconnected (or, for non-persistent
    /// clients, until the server stops answering).
    pub async fn run(mut self) {
        let mut lookups: HashSet<Eid> = HashSet::new();
        let mut punches: HashSet<Eid> = HashSet::new();
        let mut searches: HashSet<String> = HashSet::new();

        'registration: loop {
            // ── resolve ──────────────────────────────────────────────
            let addrs = match self.resolve().await {
                Ok(addrs) if !addrs.is_empty() => addrs,
                other => {
                    let error = match other {
                        Err(e) => e,
                        _ => "registration server resolved to no addresses".to_string(),
                    };
                    if self.persist {
                        tracing::debug!(server = %self.server_host, error, "resolve failed, retrying");
                        tokio::time::sleep(RESOLVE_RETRY).await;
                        continue 'registration;
                    }
                    self.fail(error, &mut lookups, &mut punches, &mut searches);
                    return;
                }
            };
            tracing::debug!(server = %self.server_host, primary = %addrs[0], "rendezvous server resolved");

            // ── fresh nonce, fresh reply route ───────────────────────
            let nonce = crypto::random32();
            let hashed_nonce = crypto::hash(&nonce);
            let (reply_tx, mut replies) = mpsc::unbounded_channel();
            self.routing.register(hashed_nonce, reply_tx);
            let _nonce_guard = NonceGuard {
                routing: self.routing.clone(),
                nonce: hashed_nonce,
            };

            let mut phase = Phase::Insert1;
            let mut challenge: Option<[u8; 32]> = None;
            let mut attempts = 0u32;
            let mut delay = RETRANSMIT_INITIAL;
            let mut retransmit_at = Some(Instant::now() + delay);
            let mut rereg_at: Option<Instant> = None;

            self.send_insert1(&addrs, hashed_nonce);

            loop {
                tokio::select! {
                    maybe = self.commands.recv() => {
                        let Some(command) = maybe else {
                            // Owner went away: best-effort delete.
                            if matches!(phase, Phase::Registered) {
                                self.send_delete(&addrs, hashed_nonce);
                            }
                            return;
                        };
                        match command {
                            Command::Lookup { target, notify } => {
                                if notify {
                                    punches.insert(target);
                                } else {
                                    lookups.insert(target);
                                }
                                if matches!(phase, Phase::Registered) {
                                    self.send_lookup(&addrs, hashed_nonce, target, notify);
                                    if retransmit_at.is_none() {
                                        attempts = 0;
                                        delay = RETRANSMIT_INITIAL;
                                        retransmit_at = Some(Instant::now() + delay);
                                    }
                                }
                            }
                            Command::Search(text) => {
                                searches.insert(text.clone());
                                if matches!(phase, Phase::Registered) {
                                    self.send_search(&addrs, hashed_nonce, &text);
                                    if retransmit_at.is_none() {
                                        attempts = 0;
                                        delay = RETRANSMIT_INITIAL;
                                        retransmit_at = Some(Instant::now() + delay);
                                    }
                                }
                            }
                            Command::Disconnect => {
                                if matches!(phase, Phase::Registered) {
                                    self.send_delete(&addrs, hashed_nonce);
                                }
                                self.fail(
                                    "disconnected".to_string(),
                                    &mut lookups,
                                    &mut punches,
                                    &mut searches,
                                );
                                return;
                            }
                        }
                    }

                    maybe = replies.recv() => {
                        let Some(buf) = maybe else { continue };
                        let response = match Response::decode(&buf) {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::debug!(error = %e, "undecodable rendezvous reply");
                                continue;
                            }
                        };
                        match response {
                            Response::Insert1 { challenge: fresh, .. } => {
                                // Initial challenge, or a re-challenge
                                // after the server rotated its secret.
                                challenge = Some(fresh);
                                phase = Phase::Insert2;
                                attempts = 0;
                                delay = RETRANSMIT_INITIAL;
                                retransmit_at = Some(Instant::now() + delay);
                                self.send_insert2(&addrs, nonce, fresh);
                            }

                            Response::Insert2 { lifetime_secs, public_ep, .. } => {
                                if matches!(phase, Phase::Registered) {
                                    continue; // duplicate delivery
                                }
                                phase = Phase::Registered;
                                let lifetime = Duration::from_secs(lifetime_secs as u64);
                                rereg_at = Some(Instant::now() + (lifetime / 2).min(REREGISTER_MAX));
                                tracing::debug!(
                                    server = %self.server_host,
                                    lifetime_secs,
                                    %public_ep,
                                    "registered"
                                );
                                let _ = self.events.send(ClientEvent::Ready { lifetime, public_ep });

                                // Requests queued before registration —
                                // or carried over one — go out now.
                                for target in &lookups {
                                    self.send_lookup(&addrs, hashed_nonce, *target, false);
                                }
                                for target in &punches {
                                    self.send_lookup(&addrs, hashed_nonce, *target, true);
                                }
                                for text in &searches {
                                    self.send_search(&addrs, hashed_nonce, text);
                                }
                                attempts = 0;
                                delay = RETRANSMIT_INITIAL;
                                retransmit_at = (!lookups.is_empty()
                                    || !punches.is_empty()
                                    || !searches.is_empty())
                                .then(|| Instant::now() + delay);
                            }

                            Response::Lookup { target, known, ep, profile, notify, .. } => {
                                let profile = (!profile.is_empty())
                                    .then(|| PeerProfile::decode(&profile).ok())
                                    .flatten();
                                if notify {
                                    if let Some(ep) = ep {
                                        let _ = self.events.send(ClientEvent::LookupNotify {
                                            origin: target,
                                            ep,
                                            profile,
                                        });
                                    }
                                } else {
                                    if !lookups.remove(&target) && !punches.remove(&target) {
                                        tracing::debug!("useless lookup result");
                                        continue;
                                    }
                                    let _ = self.events.send(ClientEvent::LookupDone {
                                        target,
                                        ep: if known { ep } else { None },
                                        profile,
                                    });
                                    if lookups.is_empty() && punches.is_empty() && searches.is_empty() {
                                        retransmit_at = None;
                                    }
                                }
                            }

                            Response::Search { text, complete, ids, .. } => {
                                if !searches.remove(&text) {
                                    tracing::debug!("useless search result");
                                    continue;
                                }
                                let _ = self.events.send(ClientEvent::SearchDone {
                                    text,
                                    ids,
                                    complete,
                                });
                                if lookups.is_empty() && punches.is_empty() && searches.is_empty() {
                                    retransmit_at = None;
                                }
                            }

                            Response::Delete { .. } => {
                                tracing::debug!("delete acknowledged");
                            }
                        }
                    }

                    _ = sleep_until_opt(retransmit_at), if retransmit_at.is_some() => {
                        attempts += 1;
                        if attempts >= MAX_ATTEMPTS {
                            if self.persist {
                                tracing::debug!(
                                    server = %self.server_host,
                                    "registration server unresponsive, starting over"
                                );
                                continue 'registration;
                            }
                            self.fail(
                                "timeout talking to registration server".to_string(),
                                &mut lookups,
                                &mut punches,
                                &mut searches,
                            );
                            return;
                        }
                        delay = delay.mul_f64(RETRANSMIT_FACTOR);
                        retransmit_at = Some(Instant::now() + delay);
                        match phase {
                            Phase::Insert1 => self.send_insert1(&addrs, hashed_nonce),
                            Phase::Insert2 => {
                                if let Some(challenge) = challenge {
                                    self.send_insert2(&addrs, nonce, challenge);
                                }
                            }
                            Phase::Registered => {
                                for target in &lookups {
                                    self.send_lookup(&addrs, hashed_nonce, *target, false);
                                }
                                for target in &punches {
                                    self.send_lookup(&addrs, hashed_nonce, *target, true);
                                }
                                for text in &searches {
                                    self.send_search(&addrs, hashed_nonce, text);
                                }
                                if lookups.is_empty() && punches.is_empty() && searches.is_empty() {
                                    retransmit_at = None;
                                }
                            }
                        }
                    }

                    _ = sleep_until_opt(rereg_at), if rereg_at.is_some() => {
                        tracing::debug!(server = %self.server_host, "re-registering");
                        continue 'registration;
                    }
                }
            }
        }
    }

    // ── Wire helpers ──────────────────────────────────────────────────────────

    async fn resolve(&self) -> Result<Vec<SocketAddr>, String> {
        // Literal addresses skip DNS entirely.
        if let Ok(ip) = self.server_host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, self.server_port)]);
        }
        match tokio::net::lookup_host((self.server_host.as_str(), self.server_port)).await {
            Ok(addrs) => Ok(addrs.collect()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Send one datagram to every server address over every socket.
    fn send(&self, addrs: &[SocketAddr], buf: &[u8]) {
        if self.sockets.is_empty() {
            tracing::warn!("no active sockets to reach the registration server");
        }
        for socket in &self.sockets {
            for addr in addrs {
                socket.send(*addr, buf);
            }
        }
    }

    fn send_insert1(&self, addrs: &[SocketAddr], hashed_nonce: [u8; 32]) {
        tracing::debug!("insert1");
        let msg = Request::Insert1 {
            eid: self.identity.eid(),
            hashed_nonce,
        }
        .encode();
        self.send(addrs, &msg);
    }

    fn send_insert2(&self, addrs: &[SocketAddr], nonce: [u8; 32], challenge: [u8; 32]) {
        tracing::debug!("insert2");
        let digest = Hasher::new()
            .update(&self.identity.eid())
            .update(&nonce)
            .update(&challenge)
            .update(&self.profile_blob)
            .finalize();
        let msg = Request::Insert2 {
            eid: self.identity.eid(),
            nonce,
            challenge,
            profile: self.profile_blob.clone(),
            pubkey: self.identity.verifying_key(),
            signature: self.identity.sign(&digest),
        }
        .encode();
        self.send(addrs, &msg);
    }

    fn send_lookup(&self, addrs: &[SocketAddr], hashed_nonce: [u8; 32], target: Eid, notify: bool) {
        tracing::debug!(dst = %hex::encode(&target[..4]), notify, "lookup");
        let msg = Request::Lookup {
            eid: self.identity.eid(),
            hashed_nonce,
            target,
            notify,
        }
        .encode();
        self.send(addrs, &msg);
    }

    fn send_search(&self, addrs: &[SocketAddr], hashed_nonce: [u8; 32], text: &str) {
        tracing::debug!(text, "search");
        let msg = Request::Search {
            eid: self.identity.eid(),
            hashed_nonce,
            text: text.to_string(),
        }
        .encode();
        self.send(addrs, &msg);
    }

    fn send_delete(&self, addrs: &[SocketAddr], hashed_nonce: [u8; 32]) {
        tracing::debug!("delete");
        let msg = Request::Delete {
            eid: self.identity.eid(),
            hashed_nonce,
        }
        .encode();
        self.send(addrs, &msg);
    }

    /// Fail every outstanding request, then report the disconnect.
    fn fail(
        &self,
        error: String,
        lookups: &mut HashSet<Eid>,
        punches: &mut HashSet<Eid>,
        searches: &mut HashSet<String>,
    ) {
        for target in lookups.drain().chain(punches.drain()) {
            let _ = self.events.send(ClientEvent::LookupDone {
                target,
                ep: None,
                profile: None,
            });
        }
        for text in searches.drain() {
            let _ = self.events.send(ClientEvent::SearchDone {
                text,
                ids: Vec::new(),
                complete: true,
            });
        }
        let _ = self.events.send(ClientEvent::Disconnected { error });
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
