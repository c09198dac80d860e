//! Initiator side of the key exchange.
//!
//! One [`Initiator`] drives one attempt against one remote endpoint:
//! hello → cookie → initiate → established, with backoff
//! retransmission, cookie-age fallback to hello, and a bounded attempt
//! budget. Inbound COOKIE datagrams reach the right attempt through the
//! host's [`InitiatorIndex`], keyed by remote endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use zerocopy::AsBytes;

use passage_core::crypto::{
    self, tail_nonce, Eid, Identity, Keypair, NonceCounter,
};
use passage_core::wire::{
    CookiePacket, HelloPacket, InitiateHeader, COOKIE_NONCE_PREFIX, HELLO_MAGIC,
    HELLO_NONCE_PREFIX, INITIATE_MAGIC, INITIATE_NONCE_PREFIX, MAX_INITIATE_PAYLOAD,
    VOUCH_NONCE_PREFIX,
};

use super::{COOKIE_LIFETIME, MAX_ATTEMPTS, RETRANSMIT_FACTOR, RETRANSMIT_INITIAL};
use crate::channel::{Channel, ChannelEvents};
use crate::dispatch::PacketReceiver;
use crate::receiver::MessageReceiver;
use crate::socket::Socket;

/// Routes COOKIE datagrams back to the attempt that is talking to that
/// endpoint. Bound to the COOKIE magic on the host dispatcher.
pub struct InitiatorIndex {
    by_endpoint: DashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>,
}

impl InitiatorIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_endpoint: DashMap::new(),
        })
    }

    /// Claim an endpoint. False if another attempt already owns it.
    fn register(&self, ep: SocketAddr, tx: mpsc::UnboundedSender<Bytes>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.by_endpoint.entry(ep) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tx);
                true
            }
        }
    }

    fn unregister(&self, ep: SocketAddr) {
        self.by_endpoint.remove(&ep);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_endpoint.len()
    }
}

impl PacketReceiver for InitiatorIndex {
    fn receive(&self, _socket: &Arc<dyn Socket>, buf: Bytes, src: SocketAddr) {
        // A cookie is only meaningful to the attempt that targets its
        // source endpoint; anything else is dropped here.
        match self.by_endpoint.get(&src) {
            Some(tx) => {
                let _ = tx.send(buf);
            }
            None => {
                tracing::trace!(%src, "cookie with no outstanding exchange");
            }
        }
    }
}

/// Keeps the index entry alive exactly as long as the attempt runs.
struct Registration {
    index: Arc<InitiatorIndex>,
    ep: SocketAddr,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.index.unregister(self.ep);
    }
}

/// How one attempt ended.
pub enum Outcome {
    /// The responder acknowledged; the channel is live.
    Established {
        channel: Arc<Channel>,
        events: ChannelEvents,
    },
    /// Retransmit budget exhausted (or the endpoint was already taken).
    Failed,
    /// cancel() — no completion is reported for this.
    Cancelled,
}

/// State carried through the initiate phase: the optimistically
/// created channel and the cookie material to echo.
struct InitiatePhase {
    channel: Arc<Channel>,
    events: Option<ChannelEvents>,
    vouch_nonce: [u8; 16],
    vouch: [u8; 48],
    cookie_nonce: [u8; 16],
    cookie_box: [u8; 80],
    born: Instant,
}

/// One outstanding key-exchange attempt.
pub struct Initiator {
    pub target: SocketAddr,
    pub remote_eid: Eid,
    pub identity: Arc<Identity>,
    pub socket: Arc<dyn Socket>,
    pub receiver: Arc<MessageReceiver>,
    pub index: Arc<InitiatorIndex>,
    /// Application payload riding inside the Initiate box (may be empty).
    pub payload: Vec<u8>,
}

impl Initiator {
    /// Drive the exchange to a terminal state. Dropping `cancel`'s
    /// sender does nothing; an explicit send cancels silently.
    pub async fn run(self, mut cancel: oneshot::Receiver<()>) -> Outcome {
        if self.payload.len() > MAX_INITIATE_PAYLOAD {
            tracing::warn!(len = self.payload.len(), "initiate payload exceeds budget");
            return Outcome::Failed;
        }

        let (cookie_tx, mut cookie_rx) = mpsc::unbounded_channel();
        if !self.index.register(self.target, cookie_tx) {
            tracing::debug!(dst = %self.target, "endpoint already has an exchange in flight");
            return Outcome::Failed;
        }
        let _registration = Registration {
            index: self.index.clone(),
            ep: self.target,
        };

        let mut short: Option<Keypair> = None;
        let mut hello_nonce = NonceCounter::new(HELLO_NONCE_PREFIX);
        let mut initiate_nonce = NonceCounter::new(INITIATE_NONCE_PREFIX);
        let mut phase: Option<InitiatePhase> = None;
        let mut established: Option<watch::Receiver<bool>> = None;

        if !self.send_hello(&mut short, &mut hello_nonce) {
            return Outcome::Failed;
        }

        let mut attempts = 0u32;
        let mut delay = RETRANSMIT_INITIAL;

        loop {
            let retransmit = tokio::time::sleep(delay);
            tokio::pin!(retransmit);

            tokio::select! {
                _ = &mut cancel => {
                    if let Some(p) = phase.take() {
                        p.channel.unbind();
                    }
                    tracing::debug!(dst = %self.target, "key exchange cancelled");
                    return Outcome::Cancelled;
                }

                maybe = cookie_rx.recv() => {
                    let Some(buf) = maybe else {
                        return Outcome::Failed;
                    };
                    // A second cookie while already in the initiate
                    // phase is a retransmission; the echoed cookie we
                    // hold is still fresh, so ignore it.
                    if phase.is_none() {
                        if let Some(p) =
                            self.process_cookie(&buf, &mut short, &mut initiate_nonce)
                        {
                            established = Some(p.channel.subscribe_established());
                            phase = Some(p);
                        }
                    }
                }

                _ = wait_established(&mut established) => {
                    let mut p = phase.take().expect("initiate phase present");
                    tracing::debug!(
                        dst = %self.target,
                        eid = %hex::encode(&self.remote_eid[..4]),
                        "channel established (initiator)"
                    );
                    let events = p.events.take().expect("events unclaimed");
                    return Outcome::Established { channel: p.channel, events };
                }

                _ = &mut retransmit => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        if let Some(p) = phase.take() {
                            p.channel.unbind();
                        }
                        tracing::debug!(dst = %self.target, attempts, "key exchange gave up");
                        return Outcome::Failed;
                    }
                    delay = delay.mul_f64(RETRANSMIT_FACTOR);

                    let cookie_expired = phase
                        .as_ref()
                        .is_some_and(|p| p.born.elapsed() >= COOKIE_LIFETIME);
                    if cookie_expired {
                        // The cookie aged past the responder's rotation
                        // window; the optimistic channel it named is
                        // dead weight. Start over from hello.
                        let p = phase.take().unwrap();
                        p.channel.unbind();
                        established = None;
                        short = None;
                        self.send_hello(&mut short, &mut hello_nonce);
                    } else {
                        match &phase {
                            None => {
                                self.send_hello(&mut short, &mut hello_nonce);
                            }
                            Some(p) => {
                                self.send_initiate(p, &mut initiate_nonce);
                            }
                        }
                    }
                }
            }
        }
    }

    fn send_hello(&self, short: &mut Option<Keypair>, nonce: &mut NonceCounter) -> bool {
        let keys = short.get_or_insert_with(Keypair::generate);

        let mut plain = [0u8; 64];
        plain[..32].copy_from_slice(&self.identity.eid());
        // The 32 trailing zeros stay: they mark this box as a hello.

        let Ok((counter, nonce24)) = nonce.next() else {
            return false;
        };
        let Ok(sealed) = crypto::seal(&plain, &nonce24, &self.remote_eid, keys.secret()) else {
            return false;
        };

        let pkt = HelloPacket {
            magic: HELLO_MAGIC.into(),
            initiator_short_pk: keys.public,
            padding: [0u8; 64],
            nonce: counter.into(),
            sealed: sealed.try_into().expect("hello box is 80 bytes"),
        };
        tracing::debug!(dst = %self.target, "sending hello");
        self.socket.send(self.target, pkt.as_bytes())
    }

    /// Validate a cookie, optimistically create the channel, and send
    /// the first Initiate.
    fn process_cookie(
        &self,
        buf: &[u8],
        short: &mut Option<Keypair>,
        initiate_nonce: &mut NonceCounter,
    ) -> Option<InitiatePhase> {
        let pkt = CookiePacket::parse(buf).ok()?;
        let keys = short.as_ref()?;

        let plain = crypto::open(
            &pkt.sealed,
            &tail_nonce(COOKIE_NONCE_PREFIX, &pkt.nonce),
            &self.remote_eid,
            keys.secret(),
        )
        .ok()?;
        if plain.len() != 128 {
            return None;
        }
        let server_short_pk: [u8; 32] = plain[..32].try_into().unwrap();
        let cookie_nonce: [u8; 16] = plain[32..48].try_into().unwrap();
        let cookie_box: [u8; 80] = plain[48..].try_into().unwrap();

        // Vouch: our short-term key, boxed long-term to long-term.
        let vouch_nonce = crypto::random16();
        let vouch: [u8; 48] = crypto::seal(
            &keys.public,
            &tail_nonce(VOUCH_NONCE_PREFIX, &vouch_nonce),
            &self.remote_eid,
            self.identity.box_secret(),
        )
        .ok()?
        .try_into()
        .expect("vouch box is 48 bytes");

        // Channel now, so the upper layer may queue sends while the
        // responder still works through our initiate.
        let keys = short.take().expect("short-term key present");
        let (channel, events) = Channel::new(
            keys,
            server_short_pk,
            self.target,
            self.socket.clone(),
            Arc::downgrade(&self.receiver),
        );
        if let Err(e) = self.receiver.bind_channel(channel.clone()) {
            tracing::debug!(dst = %self.target, error = %e, "cookie names a busy key");
            return None;
        }
        channel.start();

        let phase = InitiatePhase {
            channel,
            events: Some(events),
            vouch_nonce,
            vouch,
            cookie_nonce,
            cookie_box,
            born: Instant::now(),
        };
        self.send_initiate(&phase, initiate_nonce);
        Some(phase)
    }

    fn send_initiate(&self, phase: &InitiatePhase, nonce: &mut NonceCounter) -> bool {
        let Ok((counter, nonce24)) = nonce.next() else {
            return false;
        };

        let mut plain = Vec::with_capacity(96 + self.payload.len());
        plain.extend_from_slice(&self.identity.eid());
        plain.extend_from_slice(&phase.vouch_nonce);
        plain.extend_from_slice(&phase.vouch);
        plain.extend_from_slice(&self.payload);

        let Ok(sealed) = phase.channel.seal_raw(&nonce24, &plain) else {
            return false;
        };

        let hdr = InitiateHeader {
            magic: INITIATE_MAGIC.into(),
            initiator_short_pk: *phase.channel.local_short_pk(),
            cookie_nonce: phase.cookie_nonce,
            cookie_sealed: phase.cookie_box,
            nonce: counter.into(),
        };
        let mut buf = Vec::with_capacity(hdr.as_bytes().len() + sealed.len());
        buf.extend_from_slice(hdr.as_bytes());
        buf.extend_from_slice(&sealed);
        tracing::debug!(dst = %self.target, "sending initiate");
        self.socket.send(self.target, &buf)
    }
}

async fn wait_established(established: &mut Option<watch::Receiver<bool>>) {
    let ok = match established {
        Some(rx) => rx.wait_for(|v| *v).await.is_ok(),
        None => false,
    };
    if !ok {
        std::future::pending::<()>().await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingSocket {
        hellos: AtomicUsize,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl CountingSocket {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hellos: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl Socket for CountingSocket {
        fn send(&self, _dst: SocketAddr, buf: &[u8]) -> bool {
            if u64::from_le_bytes(buf[..8].try_into().unwrap()) == HELLO_MAGIC {
                self.hellos.fetch_add(1, Ordering::SeqCst);
            }
            self.sent.lock().unwrap().push(buf.to_vec());
            true
        }
        fn local_endpoints(&self) -> Vec<SocketAddr> {
            vec!["10.0.0.1:9660".parse().unwrap()]
        }
    }

    fn test_initiator(socket: Arc<CountingSocket>, index: Arc<InitiatorIndex>) -> Initiator {
        Initiator {
            target: "10.0.0.2:9660".parse().unwrap(),
            remote_eid: Identity::generate().eid(),
            identity: Arc::new(Identity::generate()),
            socket,
            receiver: MessageReceiver::new(),
            index,
            payload: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_hello_fails_after_budget() {
        let socket = CountingSocket::new();
        let index = InitiatorIndex::new();
        let initiator = test_initiator(socket.clone(), index.clone());

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let outcome = initiator.run(cancel_rx).await;

        assert!(matches!(outcome, Outcome::Failed));
        // Initial hello plus one resend per surviving retransmit tick.
        assert_eq!(
            socket.hellos.load(Ordering::SeqCst) as u32,
            MAX_ATTEMPTS
        );
        // Deregistered on exit.
        assert_eq!(index.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reports_no_completion() {
        let socket = CountingSocket::new();
        let index = InitiatorIndex::new();
        let initiator = test_initiator(socket, index.clone());

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(initiator.run(cancel_rx));
        tokio::task::yield_now().await;
        cancel_tx.send(()).unwrap();

        assert!(matches!(handle.await.unwrap(), Outcome::Cancelled));
        assert_eq!(index.len(), 0);
    }

    #[tokio::test]
    async fn endpoint_registration_is_exclusive() {
        let index = InitiatorIndex::new();
        let ep: SocketAddr = "10.0.0.2:9660".parse().unwrap();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        assert!(index.register(ep, tx1));
        assert!(!index.register(ep, tx2));
        index.unregister(ep);
        let (tx3, _rx3) = mpsc::unbounded_channel();
        assert!(index.register(ep, tx3));
    }

    #[tokio::test]
    async fn oversize_payload_fails_immediately() {
        let socket = CountingSocket::new();
        let index = InitiatorIndex::new();
        let mut initiator = test_initiator(socket.clone(), index);
        initiator.payload = vec![0u8; MAX_INITIATE_PAYLOAD + 1];

        let (_tx, rx) = oneshot::channel();
        assert!(matches!(initiator.run(rx).await, Outcome::Failed));
        assert_eq!(socket.hellos.load(Ordering::SeqCst), 0);
    }
}
