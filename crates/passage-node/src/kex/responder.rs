//! Responder side of the key exchange.
//!
//! Hello and Cookie processing allocate no per-initiator state — the
//! cookie IS the state, sealed under a minute key only this responder
//! holds. State appears only when an Initiate survives the full
//! validation chain and becomes a channel.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use zerocopy::{AsBytes, FromBytes};
use zeroize::Zeroizing;

use passage_core::crypto::{
    self, counter_nonce, tail_nonce, Eid, Identity, Keypair, MinuteKey,
};
use passage_core::wire::{
    CookiePacket, HelloPacket, InitiateHeader, InitiateInner, COOKIE_MAGIC, COOKIE_NONCE_PREFIX,
    HELLO_MAGIC, HELLO_NONCE_PREFIX, INITIATE_INNER_SIZE, INITIATE_MAGIC, INITIATE_NONCE_PREFIX,
    VOUCH_NONCE_PREFIX,
};

use crate::channel::{Channel, ChannelEvents};
use crate::dispatch::PacketReceiver;
use crate::receiver::MessageReceiver;
use crate::socket::Socket;

/// A channel created by an accepted Initiate, handed upward.
pub struct IncomingChannel {
    pub remote_eid: Eid,
    pub channel: Arc<Channel>,
    pub events: ChannelEvents,
}

/// Authorization hook consulted before a validated Initiate becomes a
/// channel. The default accepts everyone.
pub type Acceptor = Box<dyn Fn(SocketAddr, &Eid) -> bool + Send + Sync>;

struct MinuteKeys {
    current: MinuteKey,
    previous: MinuteKey,
}

/// Cookie nonces accepted in the current and previous minute-key
/// generation. An entry here with no live channel means the cookie was
/// already redeemed and later unbound — a replay, dropped.
struct SeenCookies {
    current: HashSet<[u8; 16]>,
    previous: HashSet<[u8; 16]>,
}

impl SeenCookies {
    fn contains(&self, nonce: &[u8; 16]) -> bool {
        self.current.contains(nonce) || self.previous.contains(nonce)
    }
}

pub struct Responder {
    identity: Arc<Identity>,
    receiver: Arc<MessageReceiver>,
    minute: Mutex<MinuteKeys>,
    seen: Mutex<SeenCookies>,
    acceptor: Acceptor,
    incoming: mpsc::UnboundedSender<IncomingChannel>,
}

impl Responder {
    pub fn new(
        identity: Arc<Identity>,
        receiver: Arc<MessageReceiver>,
        incoming: mpsc::UnboundedSender<IncomingChannel>,
    ) -> Arc<Self> {
        Self::with_acceptor(identity, receiver, incoming, Box::new(|_, _| true))
    }

    pub fn with_acceptor(
        identity: Arc<Identity>,
        receiver: Arc<MessageReceiver>,
        incoming: mpsc::UnboundedSender<IncomingChannel>,
        acceptor: Acceptor,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            receiver,
            minute: Mutex::new(MinuteKeys {
                current: MinuteKey::generate(),
                previous: MinuteKey::generate(),
            }),
            seen: Mutex::new(SeenCookies {
                current: HashSet::new(),
                previous: HashSet::new(),
            }),
            acceptor,
            incoming,
        })
    }

    /// Advance the minute-key generation. Cookies sealed two rotations
    /// ago become unredeemable. The host drives this every 60 s.
    pub fn rotate_minute_key(&self) {
        {
            let mut minute = self.minute.lock().unwrap();
            minute.previous = std::mem::replace(&mut minute.current, MinuteKey::generate());
        }
        let mut seen = self.seen.lock().unwrap();
        seen.previous = std::mem::take(&mut seen.current);
    }

    // ── Hello ─────────────────────────────────────────────────────────────────

    fn got_hello(&self, socket: &Arc<dyn Socket>, buf: &[u8], src: SocketAddr) {
        let Ok(pkt) = HelloPacket::parse(buf) else {
            tracing::trace!(%src, "malformed hello");
            return;
        };
        let nonce = counter_nonce(HELLO_NONCE_PREFIX, pkt.nonce.get());
        let Ok(plain) = crypto::open(
            &pkt.sealed,
            &nonce,
            &pkt.initiator_short_pk,
            self.identity.box_secret(),
        ) else {
            tracing::trace!(%src, "hello box rejected");
            return;
        };
        // Inner plaintext: initiator long-term key, then 32 zero bytes
        // distinguishing a hello from anything application-shaped.
        if plain.len() != 64 || plain[32..] != [0u8; 32] {
            tracing::trace!(%src, "hello plaintext malformed");
            return;
        }

        self.send_cookie(socket, &pkt.initiator_short_pk, src);
    }

    fn send_cookie(&self, socket: &Arc<dyn Socket>, initiator_short_pk: &[u8; 32], src: SocketAddr) {
        // Fresh short-term pair for this prospective channel. The
        // secret leaves this function only inside the cookie.
        let server_short = Keypair::generate();
        let minute_tail = crypto::random16();

        let mut cookie_plain = Zeroizing::new([0u8; 64]);
        cookie_plain[..32].copy_from_slice(initiator_short_pk);
        cookie_plain[32..].copy_from_slice(&server_short.secret().to_bytes());

        let minute = self.minute.lock().unwrap();
        let Ok(cookie_sealed) = minute.current.seal(&cookie_plain[..], &minute_tail) else {
            return;
        };
        drop(minute);

        let mut outer_plain = [0u8; 128];
        outer_plain[..32].copy_from_slice(&server_short.public);
        outer_plain[32..48].copy_from_slice(&minute_tail);
        outer_plain[48..].copy_from_slice(&cookie_sealed);

        let outer_tail = crypto::random16();
        let Ok(sealed) = crypto::seal(
            &outer_plain,
            &tail_nonce(COOKIE_NONCE_PREFIX, &outer_tail),
            initiator_short_pk,
            self.identity.box_secret(),
        ) else {
            return;
        };

        let pkt = CookiePacket {
            magic: COOKIE_MAGIC.into(),
            nonce: outer_tail,
            sealed: sealed.try_into().expect("cookie box is 144 bytes"),
        };
        socket.send(src, pkt.as_bytes());
        tracing::debug!(%src, "sent cookie");
        // No state retained: server_short drops here, recoverable only
        // through the cookie itself.
    }

    // ── Initiate ──────────────────────────────────────────────────────────────

    fn got_initiate(&self, socket: &Arc<dyn Socket>, buf: &[u8], src: SocketAddr) {
        let Ok((hdr, sealed_tail)) = InitiateHeader::parse(buf) else {
            tracing::trace!(%src, "malformed initiate");
            return;
        };

        // Open the echoed cookie under a live minute-key generation.
        let cookie_plain = {
            let minute = self.minute.lock().unwrap();
            match minute.current.open(&hdr.cookie_sealed, &hdr.cookie_nonce) {
                Ok(p) => p,
                Err(_) => match minute.previous.open(&hdr.cookie_sealed, &hdr.cookie_nonce) {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::debug!(%src, "initiate cookie from evicted generation");
                        return;
                    }
                },
            }
        };
        if cookie_plain.len() != 64 {
            return;
        }
        if cookie_plain[..32] != hdr.initiator_short_pk {
            tracing::debug!(%src, "initiate cookie bound to a different initiator key");
            return;
        }
        let server_short = Keypair::from_secret(
            cookie_plain[32..].try_into().expect("cookie holds 32-byte secret"),
        );

        // Retransmitted Initiate for a channel that already exists:
        // re-acknowledge so the initiator stops resending, never
        // instantiate twice.
        if let Some(existing) = self.receiver.channel_with_local(&server_short.public) {
            tracing::debug!(%src, "initiate retransmission, re-acknowledging");
            let _ = existing.send_message(&[]);
            return;
        }

        // Redeemed before but no channel anymore — a replay.
        if self.seen.lock().unwrap().contains(&hdr.cookie_nonce) {
            tracing::debug!(%src, "replayed initiate for an unbound channel");
            return;
        }

        let Ok(plain) = crypto::open(
            sealed_tail,
            &counter_nonce(INITIATE_NONCE_PREFIX, hdr.nonce.get()),
            &hdr.initiator_short_pk,
            server_short.secret(),
        ) else {
            tracing::debug!(%src, "initiate box rejected");
            return;
        };
        let Some(inner) = InitiateInner::read_from_prefix(&plain) else {
            return;
        };
        let payload = &plain[INITIATE_INNER_SIZE..];

        // The vouch proves the short-term key was chosen by the holder
        // of the claimed long-term identity.
        let Ok(vouched) = crypto::open(
            &inner.vouch_sealed,
            &tail_nonce(VOUCH_NONCE_PREFIX, &inner.vouch_nonce),
            &inner.initiator_long_pk,
            self.identity.box_secret(),
        ) else {
            tracing::debug!(%src, "vouch box rejected");
            return;
        };
        if vouched[..] != hdr.initiator_short_pk {
            tracing::debug!(%src, "vouched key does not match initiate header");
            return;
        }

        let remote_eid: Eid = inner.initiator_long_pk;
        if !(self.acceptor)(src, &remote_eid) {
            tracing::debug!(%src, eid = %hex::encode(&remote_eid[..4]), "initiator refused");
            return;
        }

        let (channel, events) = Channel::new(
            server_short,
            hdr.initiator_short_pk,
            src,
            socket.clone(),
            Arc::downgrade(&self.receiver),
        );
        if let Err(e) = self.receiver.bind_channel(channel.clone()) {
            tracing::debug!(%src, error = %e, "could not bind accepted channel");
            return;
        }
        self.seen.lock().unwrap().current.insert(hdr.cookie_nonce);

        channel.start();
        channel.deliver_initial(payload);
        tracing::debug!(
            %src,
            eid = %hex::encode(&remote_eid[..4]),
            "channel established (responder)"
        );

        let _ = self.incoming.send(IncomingChannel {
            remote_eid,
            channel: channel.clone(),
            events,
        });

        // Implicit ack: a zero-payload message stops the initiator's
        // retransmissions.
        let _ = channel.send_message(&[]);
    }
}

impl PacketReceiver for Responder {
    fn receive(&self, socket: &Arc<dyn Socket>, buf: Bytes, src: SocketAddr) {
        match u64::from_le_bytes(buf[..8].try_into().unwrap()) {
            HELLO_MAGIC => self.got_hello(socket, &buf, src),
            INITIATE_MAGIC => self.got_initiate(socket, &buf, src),
            _ => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
