//! Registration server — the authoritative rendezvous directory.
//!
//! Insertion is cookie-challenged (INSERT1 proves round-trip
//! connectivity before any signature is checked) and
//! signature-authenticated (INSERT2 binds the record to the claimed
//! identity). Records live one hour unless refreshed, feed a keyword
//! index for SEARCH, and answer LOOKUP with optional hole-punch
//! notification of the target.
//!
//! All state is owned by the single server task; handlers run
//! synchronously per datagram.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use passage_core::crypto::{self, Eid, Hasher, Identity};
use passage_core::profile::PeerProfile;

use passage_node::socket::{Inbound, Socket};

use crate::proto::{Request, Response, MAX_RESULTS, ProtoError};

/// Records last one hour unless refreshed or deleted.
pub const RECORD_LIFETIME: Duration = Duration::from_secs(3600);

/// How often the expiry sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct Record {
    hashed_nonce: [u8; 32],
    ep: SocketAddr,
    profile: Vec<u8>,
    keywords: Vec<String>,
    expires_at: Instant,
}

pub struct RegistrationServer {
    identity: Arc<Identity>,
    /// Process-lifetime cookie secret. If it were ever rotated, stale
    /// cookies just fail validation and clients re-enter INSERT1.
    secret: [u8; 32],
    records: HashMap<Eid, Record>,
    keywords: HashMap<String, HashSet<Eid>>,
    /// Challenge cookie → cached INSERT2 reply. An empty entry records
    /// a rejected cookie: ignore all its retries.
    challenges: HashMap<[u8; 32], Vec<u8>>,
}

impl RegistrationServer {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity: Arc::new(identity),
            secret: crypto::random32(),
            records: HashMap::new(),
            keywords: HashMap::new(),
            challenges: HashMap::new(),
        }
    }

    /// Serve until the inbound queue closes.
    pub async fn run(mut self, socket: Arc<dyn Socket>, mut inbound: mpsc::Receiver<Inbound>) {
        tracing::info!(eid = %hex::encode(&self.identity.eid()[..4]), "registration server up");
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweep.tick() => self.expire_records(),

                maybe = inbound.recv() => {
                    let Some((buf, src)) = maybe else {
                        tracing::info!("registration server shutting down");
                        return;
                    };
                    self.handle(&socket, &buf, src);
                }
            }
        }
    }

    /// Decode and dispatch one datagram. Malformed input is dropped
    /// with a debug note; this is an attacker-facing surface.
    pub fn handle(&mut self, socket: &Arc<dyn Socket>, buf: &[u8], src: SocketAddr) {
        let request = match Request::decode(buf) {
            Ok(r) => r,
            Err(ProtoError::BadMagic) => return,
            Err(e) => {
                tracing::debug!(%src, error = %e, "malformed registration request");
                return;
            }
        };
        match request {
            Request::Insert1 { eid, hashed_nonce } => {
                self.do_insert1(socket, src, eid, hashed_nonce)
            }
            Request::Insert2 {
                eid,
                nonce,
                challenge,
                profile,
                pubkey,
                signature,
            } => self.do_insert2(socket, src, eid, nonce, challenge, profile, pubkey, signature),
            Request::Lookup {
                eid,
                hashed_nonce,
                target,
                notify,
            } => self.do_lookup(socket, src, eid, hashed_nonce, target, notify),
            Request::Search {
                eid,
                hashed_nonce,
                text,
            } => self.do_search(socket, src, eid, hashed_nonce, text),
            Request::Delete { eid, hashed_nonce } => {
                self.do_delete(socket, src, eid, hashed_nonce)
            }
        }
    }

    // ── Cookie ────────────────────────────────────────────────────────────────

    /// challenge = H(secret ‖ src ‖ own EID ‖ caller EID ‖ NHi ‖ secret).
    /// Round-trip proof that costs the server nothing to verify.
    fn calc_cookie(&self, src: SocketAddr, eid: &Eid, hashed_nonce: &[u8; 32]) -> [u8; 32] {
        let mut h = Hasher::new();
        h.update(&self.secret);
        match src.ip() {
            std::net::IpAddr::V4(a) => h.update(&a.octets()),
            std::net::IpAddr::V6(a) => h.update(&a.octets()),
        };
        h.update(&src.port().to_le_bytes())
            .update(&self.identity.eid())
            .update(eid)
            .update(hashed_nonce)
            .update(&self.secret);
        h.finalize()
    }

    // ── INSERT1 ───────────────────────────────────────────────────────────────

    fn do_insert1(
        &mut self,
        socket: &Arc<dyn Socket>,
        src: SocketAddr,
        eid: Eid,
        hashed_nonce: [u8; 32],
    ) {
        tracing::debug!(%src, "insert1");
        self.reply_insert1(socket, src, &eid, &hashed_nonce);
    }

    fn reply_insert1(
        &self,
        socket: &Arc<dyn Socket>,
        src: SocketAddr,
        eid: &Eid,
        hashed_nonce: &[u8; 32],
    ) {
        let reply = Response::Insert1 {
            hashed_nonce: *hashed_nonce,
            challenge: self.calc_cookie(src, eid, hashed_nonce),
        };
        socket.send(src, &reply.encode());
    }

    // ── INSERT2 ───────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn do_insert2(
        &mut self,
        socket: &Arc<dyn Socket>,
        src: SocketAddr,
        eid: Eid,
        nonce: [u8; 32],
        challenge: [u8; 32],
        profile: Vec<u8>,
        pubkey: [u8; 32],
        signature: [u8; 64],
    ) {
        tracing::debug!(%src, "insert2");

        // INSERT1 carried the hash of the nonce; INSERT2 reveals the
        // nonce itself, so an eavesdropper on the INSERT1 exchange
        // cannot forge this step.
        let hashed_nonce = crypto::hash(&nonce);

        // Stale cookie (likely a rotated secret): not an error, just
        // hand the client a fresh challenge.
        if self.calc_cookie(src, &eid, &hashed_nonce) != challenge {
            tracing::debug!(%src, "insert2 with stale cookie, re-challenging");
            return self.reply_insert1(socket, src, &eid, &hashed_nonce);
        }

        // Replay of a cookie we already answered: repeat the exact
        // reply bytes. An empty cached entry marks a rejected client.
        if let Some(cached) = self.challenges.get(&challenge) {
            tracing::debug!(%src, "replayed insert2");
            if !cached.is_empty() {
                socket.send(src, cached);
            }
            return;
        }

        // The supplied verifying key must map to the claimed EID.
        if crypto::eid_of_verifying_key(&pubkey) != Some(eid) {
            tracing::debug!(%src, "insert2 identity does not match EID");
            self.challenges.insert(challenge, Vec::new());
            return;
        }

        // Signature over H(EIDi ‖ Ni ‖ challenge ‖ profile).
        let digest = Hasher::new()
            .update(&eid)
            .update(&nonce)
            .update(&challenge)
            .update(&profile)
            .finalize();
        if !crypto::verify_signed_digest(&pubkey, &digest, &signature) {
            tracing::debug!(%src, "insert2 signature check failed");
            self.challenges.insert(challenge, Vec::new());
            return;
        }

        // Create or replace, which also restarts the record timeout.
        if self.records.contains_key(&eid) {
            tracing::debug!(eid = %hex::encode(&eid[..4]), "replacing existing record");
            self.remove_record(&eid);
        }
        let keywords = PeerProfile::decode(&profile)
            .map(|p| p.keywords())
            .unwrap_or_default();
        for kw in &keywords {
            self.keywords.entry(kw.clone()).or_default().insert(eid);
        }
        self.records.insert(
            eid,
            Record {
                hashed_nonce,
                ep: src,
                profile,
                keywords,
                expires_at: Instant::now() + RECORD_LIFETIME,
            },
        );

        let reply = Response::Insert2 {
            hashed_nonce,
            lifetime_secs: RECORD_LIFETIME.as_secs() as u32,
            public_ep: src,
        }
        .encode();
        self.challenges.insert(challenge, reply.to_vec());
        socket.send(src, &reply);
        tracing::debug!(eid = %hex::encode(&eid[..4]), %src, "record inserted");
    }

    // ── Caller authentication ─────────────────────────────────────────────────

    /// Requests past insertion require a registered caller speaking
    /// from the registered endpoint with the registered nonce hash.
    fn find_caller(
        &self,
        src: SocketAddr,
        eid: &Eid,
        hashed_nonce: &[u8; 32],
    ) -> Option<&Record> {
        let record = self.records.get(eid)?;
        if record.ep != src {
            tracing::debug!(%src, expected = %record.ep, "request from wrong endpoint");
            return None;
        }
        if &record.hashed_nonce != hashed_nonce {
            tracing::debug!(%src, "request with wrong nonce hash");
            return None;
        }
        Some(record)
    }

    // ── LOOKUP ────────────────────────────────────────────────────────────────

    fn do_lookup(
        &mut self,
        socket: &Arc<dyn Socket>,
        src: SocketAddr,
        eid: Eid,
        hashed_nonce: [u8; 32],
        target: Eid,
        notify: bool,
    ) {
        let Some(caller) = self.find_caller(src, &eid, &hashed_nonce) else {
            return;
        };
        let caller_ep = caller.ep;
        let caller_profile = caller.profile.clone();

        // Always answer, found or not, so the caller never waits out a
        // timeout on a negative.
        let found = self.records.get(&target);
        let reply = Response::Lookup {
            hashed_nonce,
            target,
            known: found.is_some(),
            ep: found.map(|r| r.ep),
            profile: found.map(|r| r.profile.clone()).unwrap_or_default(),
            notify: false,
        };
        socket.send(src, &reply.encode());

        // Tell the target who is looking, so both sides can punch
        // through their NATs at once.
        if notify {
            if let Some(target_record) = self.records.get(&target) {
                let punch = Response::Lookup {
                    hashed_nonce: target_record.hashed_nonce,
                    target: eid,
                    known: true,
                    ep: Some(caller_ep),
                    profile: caller_profile,
                    notify: true,
                };
                socket.send(target_record.ep, &punch.encode());
                tracing::debug!(to = %target_record.ep, "lookup notify sent");
            }
        }
    }

    // ── SEARCH ────────────────────────────────────────────────────────────────

    fn do_search(
        &mut self,
        socket: &Arc<dyn Socket>,
        src: SocketAddr,
        eid: Eid,
        hashed_nonce: [u8; 32],
        text: String,
    ) {
        if self.find_caller(src, &eid, &hashed_nonce).is_none() {
            return;
        }

        // Tokens form an AND-set; sub-2-character tokens are noise.
        let tokens: Vec<&str> = text
            .split_whitespace()
            .filter(|w| w.len() >= passage_core::profile::MIN_KEYWORD)
            .collect();

        let mut ids: Vec<Eid>;
        if tokens.is_empty() {
            // No usable keywords: every record matches.
            ids = self.records.keys().copied().collect();
        } else {
            // Start from the scarcest keyword to keep the
            // intersections small.
            let mut sets: Vec<&HashSet<Eid>> = Vec::with_capacity(tokens.len());
            for token in &tokens {
                match self.keywords.get(*token) {
                    Some(set) => sets.push(set),
                    None => {
                        sets.clear();
                        break;
                    }
                }
            }
            if sets.is_empty() {
                ids = Vec::new();
            } else {
                sets.sort_by_key(|s| s.len());
                ids = sets[0]
                    .iter()
                    .filter(|id| sets[1..].iter().all(|s| s.contains(*id)))
                    .copied()
                    .collect();
            }
        }

        ids.sort_unstable();
        let complete = ids.len() <= MAX_RESULTS;
        ids.truncate(MAX_RESULTS);

        let reply = Response::Search {
            hashed_nonce,
            text,
            complete,
            ids,
        };
        socket.send(src, &reply.encode());
    }

    // ── DELETE ────────────────────────────────────────────────────────────────

    fn do_delete(
        &mut self,
        socket: &Arc<dyn Socket>,
        src: SocketAddr,
        eid: Eid,
        hashed_nonce: [u8; 32],
    ) {
        if self.find_caller(src, &eid, &hashed_nonce).is_none() {
            return;
        }
        self.remove_record(&eid);
        tracing::debug!(eid = %hex::encode(&eid[..4]), "record deleted by owner");

        let reply = Response::Delete {
            hashed_nonce,
            was_deleted: true,
        };
        socket.send(src, &reply.encode());
    }

    // ── Record lifecycle ──────────────────────────────────────────────────────

    fn remove_record(&mut self, eid: &Eid) {
        let Some(record) = self.records.remove(eid) else {
            return;
        };
        for kw in &record.keywords {
            if let Some(set) = self.keywords.get_mut(kw) {
                set.remove(eid);
                if set.is_empty() {
                    self.keywords.remove(kw);
                }
            }
        }
    }

    fn expire_records(&mut self) {
        let now = Instant::now();
        let expired: Vec<Eid> = self
            .records
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(eid, _)| *eid)
            .collect();
        for eid in expired {
            tracing::debug!(eid = %hex::encode(&eid[..4]), "record timed out");
            self.remove_record(&eid);
        }
    }

    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.records.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
