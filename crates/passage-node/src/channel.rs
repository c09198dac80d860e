//! Channel — an established encrypted datagram pipe between two hosts,
//! keyed by their short-term keys.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use zerocopy::AsBytes;

use passage_core::crypto::{
    counter_nonce, is_even_side, CryptoError, Keypair, Nonce, NonceCounter, PairBox,
};
use passage_core::wire::{
    MessageHeader, MAX_MESSAGE_PAYLOAD, MESSAGE_MAGIC, MESSAGE_NONCE_PREFIX,
};

use crate::receiver::MessageReceiver;
use crate::socket::Socket;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not active")]
    Inactive,

    #[error("payload of {0} bytes exceeds the message budget")]
    PayloadTooLarge(usize),

    #[error("send nonce exhausted; channel torn down")]
    NonceExhausted,

    #[error("transport refused the datagram")]
    Transport,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Crypto state dropped on unbind. Dropping it wipes the short-term
/// secret, which is what makes old traffic undecodable afterwards.
struct ChannelCrypto {
    #[allow(dead_code)] // held so the secret lives exactly as long as the binding
    keys: Keypair,
    pair: PairBox,
    send_nonce: NonceCounter,
}

/// Receiving half handed to whoever owns the channel.
pub struct ChannelEvents {
    /// Decrypted application payloads, in arrival order.
    pub incoming: mpsc::UnboundedReceiver<Bytes>,
    /// Flips to true on the first authenticated inbound packet.
    pub established: watch::Receiver<bool>,
}

/// The per-session endpoint. Boxes outgoing and unboxes incoming
/// MESSAGE payloads under the channel's short-term pair.
pub struct Channel {
    local_pk: [u8; 32],
    remote_pk: [u8; 32],
    remote_ep: SocketAddr,
    socket: Arc<dyn Socket>,
    receiver: Weak<MessageReceiver>,
    active: AtomicBool,
    /// True when the remote side takes odd nonce counters.
    remote_odd: bool,
    crypto: Mutex<Option<ChannelCrypto>>,
    incoming: mpsc::UnboundedSender<Bytes>,
    established: watch::Sender<bool>,
}

impl Channel {
    /// Create a channel bound to `remote_ep`. The channel starts
    /// inactive; call [`Channel::start`] once it may send and accept
    /// packets.
    pub fn new(
        local: Keypair,
        remote_pk: [u8; 32],
        remote_ep: SocketAddr,
        socket: Arc<dyn Socket>,
        receiver: Weak<MessageReceiver>,
    ) -> (Arc<Self>, ChannelEvents) {
        let local_even = is_even_side(&local.public, &remote_pk);
        let pair = PairBox::new(&remote_pk, local.secret());
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (established_tx, established_rx) = watch::channel(false);

        let channel = Arc::new(Self {
            local_pk: local.public,
            remote_pk,
            remote_ep,
            socket,
            receiver,
            active: AtomicBool::new(false),
            remote_odd: local_even,
            crypto: Mutex::new(Some(ChannelCrypto {
                pair,
                send_nonce: NonceCounter::paired(MESSAGE_NONCE_PREFIX, local_even),
                keys: local,
            })),
            incoming: incoming_tx,
            established: established_tx,
        });
        (
            channel,
            ChannelEvents {
                incoming: incoming_rx,
                established: established_rx,
            },
        )
    }

    pub fn local_short_pk(&self) -> &[u8; 32] {
        &self.local_pk
    }

    pub fn remote_short_pk(&self) -> &[u8; 32] {
        &self.remote_pk
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_ep
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start sending and accepting packets. Callers emit their
    /// connected notifications strictly after this.
    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// A fresh view of the establishment flag. Already-established
    /// channels report true immediately.
    pub fn subscribe_established(&self) -> watch::Receiver<bool> {
        self.established.subscribe()
    }

    /// Box `payload` and emit it as a MESSAGE datagram.
    pub fn send_message(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Inactive);
        }
        if payload.len() > MAX_MESSAGE_PAYLOAD {
            return Err(ChannelError::PayloadTooLarge(payload.len()));
        }

        let (counter, sealed) = {
            let mut guard = self.crypto.lock().unwrap();
            let state = guard.as_mut().ok_or(ChannelError::Inactive)?;
            let (counter, nonce) = match state.send_nonce.next() {
                Ok(n) => n,
                Err(CryptoError::NonceExhausted) => {
                    // Refuse to wrap: this channel is spent. Tear it
                    // down so the owner re-keys with a fresh exchange.
                    drop(guard);
                    self.unbind();
                    return Err(ChannelError::NonceExhausted);
                }
                Err(e) => return Err(e.into()),
            };
            (counter, state.pair.seal(payload, &nonce)?)
        };

        let header = MessageHeader {
            magic: MESSAGE_MAGIC.into(),
            sender_short_pk: self.local_pk,
            nonce: counter.into(),
        };
        let mut buf = Vec::with_capacity(header.as_bytes().len() + sealed.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&sealed);

        if self.socket.send(self.remote_ep, &buf) {
            Ok(())
        } else {
            Err(ChannelError::Transport)
        }
    }

    /// Seal raw bytes under the channel pair with a caller-chosen nonce.
    /// Used by the key exchange for the Initiate box, which rides the
    /// same short-term pair as the channel itself.
    pub(crate) fn seal_raw(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let guard = self.crypto.lock().unwrap();
        let state = guard.as_ref().ok_or(ChannelError::Inactive)?;
        Ok(state.pair.seal(plaintext, nonce)?)
    }

    /// Handle one MESSAGE datagram addressed to this channel.
    ///
    /// Authentication failure is a silent drop, not a channel-breaking
    /// event — anyone can inject packets at a known endpoint.
    pub fn receive(&self, buf: &[u8], src: SocketAddr) {
        if !self.is_active() {
            return;
        }
        let Ok((header, sealed)) = MessageHeader::parse(buf) else {
            return;
        };
        let counter = header.nonce.get();

        // Both directions box under the same pair; the parity split is
        // the only thing separating their nonce spaces. A counter with
        // our own parity is a reflected packet.
        if (counter % 2 == 1) != self.remote_odd {
            tracing::trace!(%src, counter, "dropping message with own nonce parity");
            return;
        }

        let plaintext = {
            let guard = self.crypto.lock().unwrap();
            let Some(state) = guard.as_ref() else {
                return;
            };
            let nonce = counter_nonce(MESSAGE_NONCE_PREFIX, counter);
            match state.pair.open(sealed, &nonce) {
                Ok(p) => p,
                Err(_) => {
                    tracing::trace!(%src, "dropping unauthenticated message");
                    return;
                }
            }
        };

        self.established.send_replace(true);
        // Zero-payload messages are pure acknowledgements; there is
        // nothing to deliver upward.
        if !plaintext.is_empty() {
            let _ = self.incoming.send(plaintext.into());
        }
    }

    /// Mark established and deliver a payload that arrived inside the
    /// key exchange itself (the Initiate payload on the responder side).
    pub(crate) fn deliver_initial(&self, payload: &[u8]) {
        self.established.send_replace(true);
        if !payload.is_empty() {
            let _ = self.incoming.send(Bytes::copy_from_slice(payload));
        }
    }

    /// Stop the channel and wipe its keys. After this no packet can be
    /// decoded — forward secrecy for everything the channel carried.
    pub fn unbind(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.crypto.lock().unwrap().take();
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.unbind_channel(&self.remote_pk);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
