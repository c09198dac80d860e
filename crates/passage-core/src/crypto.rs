//! Cryptographic primitives for Passage.
//!
//! Provides three things:
//!   1. BLAKE3 hashing — nonce commitments, registration cookies, signed digests
//!   2. NaCl boxes (Curve25519 + XSalsa20-Poly1305) — every sealed field on the wire
//!   3. Host identity — an Ed25519 signing key with its X25519 box key
//!      derived sodium-style, so one seed covers both vouching and
//!      registration signatures
//!
//! All key material is wiped from memory when dropped. There is no
//! unsafe code in this module.

use std::path::{Path, PathBuf};

use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use crypto_secretbox::aead::KeyInit;
use crypto_secretbox::XSalsa20Poly1305;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// 24-byte XSalsa20 nonce, assembled from a fixed ASCII prefix and a
/// counter or random tail. Never constructed ad hoc.
pub type Nonce = crypto_box::Nonce;

/// Endpoint identifier — a host's long-term Curve25519 public key.
pub type Eid = [u8; 32];

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for registration nonce commitments, server challenge cookies,
/// and the digest that INSERT2 signatures cover.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for digests over several fields.
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Randomness ────────────────────────────────────────────────────────────────

/// Generate a cryptographically random 16-byte nonce tail.
pub fn random16() -> [u8; 16] {
    let mut out = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Generate a cryptographically random 32-byte value.
pub fn random32() -> [u8; 32] {
    let mut out = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// An ephemeral X25519 keypair — the short-term key of one channel.
///
/// One pair per channel; the secret is zeroized on drop, which is what
/// makes unbinding a channel forward-secret.
pub struct Keypair {
    secret: SecretKey,
    /// Public key — appears in packet headers and channel tables.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut rand::thread_rng());
        let public = *secret.public_key().as_bytes();
        Self { secret, public }
    }

    /// Reconstruct a keypair from secret bytes (cookie recovery path).
    pub fn from_secret(bytes: [u8; 32]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = *secret.public_key().as_bytes();
        Self { secret, public }
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A host's long-term identity.
///
/// The seed is an Ed25519 signing key; the X25519 box key is derived
/// from it the way libsodium's sign-to-curve conversion does, so the
/// same identity both vouches for short-term keys (boxes) and signs
/// registration records (Ed25519). The EID — the identifier other hosts
/// and the rendezvous directory know this host by — is the X25519
/// public key.
pub struct Identity {
    signing: SigningKey,
    box_secret: SecretKey,
    eid: Eid,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self::from_seed(SigningKey::generate(&mut rand::thread_rng()).to_bytes())
    }

    /// Reconstruct an identity from its stored 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let scalar = Zeroizing::new(signing.to_scalar_bytes());
        let box_secret = SecretKey::from(*scalar);
        let eid = *box_secret.public_key().as_bytes();
        Self {
            signing,
            box_secret,
            eid,
        }
    }

    /// Load the identity from `path`, generating and persisting a fresh
    /// one if the file does not exist yet.
    ///
    /// The file holds the raw 32-byte seed. Store it with owner-only
    /// permissions; everything else is derived on load.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let seed: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::BadSeed(bytes.len()))?;
                Ok(Self::from_seed(seed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| CryptoError::Io(path.to_owned(), e))?;
                }
                std::fs::write(path, &identity.seed()[..])
                    .map_err(|e| CryptoError::Io(path.to_owned(), e))?;
                Ok(identity)
            }
            Err(e) => Err(CryptoError::Io(path.to_owned(), e)),
        }
    }

    /// Serialize the seed for persistent storage.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// The host's EID — its long-term X25519 public key.
    pub fn eid(&self) -> Eid {
        self.eid
    }

    /// The long-term box secret, for hello/cookie/vouch operations.
    pub fn box_secret(&self) -> &SecretKey {
        &self.box_secret
    }

    /// The Ed25519 verifying key, disclosed only inside INSERT2.
    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a 32-byte digest with the Ed25519 key.
    pub fn sign(&self, digest: &[u8; 32]) -> [u8; 64] {
        self.signing.sign(digest).to_bytes()
    }
}

/// Map an Ed25519 verifying key to the EID it corresponds to.
///
/// Returns None for byte strings that are not a valid Ed25519 point —
/// the registration server's "unsupported identity scheme" case.
pub fn eid_of_verifying_key(vk: &[u8; 32]) -> Option<Eid> {
    let vk = VerifyingKey::from_bytes(vk).ok()?;
    Some(vk.to_montgomery().to_bytes())
}

/// Verify an Ed25519 signature over a 32-byte digest.
pub fn verify_signed_digest(vk: &[u8; 32], digest: &[u8; 32], sig: &[u8; 64]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(vk) else {
        return false;
    };
    vk.verify(digest, &Signature::from_bytes(sig)).is_ok()
}

// ── Boxes ─────────────────────────────────────────────────────────────────────

/// Seal `plaintext` to `their_pk` from `my_sk`. Output is plaintext
/// length plus 16 tag bytes.
pub fn seal(
    plaintext: &[u8],
    nonce: &Nonce,
    their_pk: &[u8; 32],
    my_sk: &SecretKey,
) -> Result<Vec<u8>, CryptoError> {
    SalsaBox::new(&PublicKey::from(*their_pk), my_sk)
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::BoxFailed)
}

/// Open a box sealed to `my_sk` from `their_pk`.
pub fn open(
    sealed: &[u8],
    nonce: &Nonce,
    their_pk: &[u8; 32],
    my_sk: &SecretKey,
) -> Result<Vec<u8>, CryptoError> {
    SalsaBox::new(&PublicKey::from(*their_pk), my_sk)
        .decrypt(nonce, sealed)
        .map_err(|_| CryptoError::BoxAuth)
}

/// A precomputed box for one key pair — the per-channel fast path.
pub struct PairBox(SalsaBox);

impl PairBox {
    pub fn new(their_pk: &[u8; 32], my_sk: &SecretKey) -> Self {
        Self(SalsaBox::new(&PublicKey::from(*their_pk), my_sk))
    }

    pub fn seal(&self, plaintext: &[u8], nonce: &Nonce) -> Result<Vec<u8>, CryptoError> {
        self.0
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::BoxFailed)
    }

    pub fn open(&self, sealed: &[u8], nonce: &Nonce) -> Result<Vec<u8>, CryptoError> {
        self.0
            .decrypt(nonce, sealed)
            .map_err(|_| CryptoError::BoxAuth)
    }
}

// ── Nonces ────────────────────────────────────────────────────────────────────

/// Assemble a nonce from a 16-byte prefix and an 8-byte LE counter.
pub fn counter_nonce(prefix: &[u8; 16], counter: u64) -> Nonce {
    let mut out = [0u8; 24];
    out[..16].copy_from_slice(prefix);
    out[16..].copy_from_slice(&counter.to_le_bytes());
    out.into()
}

/// Assemble a nonce from an 8-byte prefix and a 16-byte tail.
pub fn tail_nonce(prefix: &[u8; 8], tail: &[u8; 16]) -> Nonce {
    let mut out = [0u8; 24];
    out[..8].copy_from_slice(prefix);
    out[8..].copy_from_slice(tail);
    out.into()
}

/// True if the side holding `local` takes the even counters.
///
/// The side whose short-term public key is lexicographically smaller
/// uses even counters; the other side uses odd. Both directions of a
/// channel box under the same key pair, so the parity split is what
/// keeps the nonce space disjoint.
pub fn is_even_side(local: &[u8; 32], remote: &[u8; 32]) -> bool {
    local < remote
}

/// Monotonic nonce counter bound to one prefix.
///
/// `new` counts every integer — for prefixes only one side ever seals
/// under. `paired` steps by two from the side's parity — for the
/// message prefix, where both channel ends share a key pair.
///
/// On saturation, `next` refuses rather than wrapping; the caller must
/// tear the channel down and re-key.
pub struct NonceCounter {
    prefix: &'static [u8; 16],
    next: u64,
    step: u64,
}

impl NonceCounter {
    pub fn new(prefix: &'static [u8; 16]) -> Self {
        Self {
            prefix,
            next: 0,
            step: 1,
        }
    }

    pub fn paired(prefix: &'static [u8; 16], even: bool) -> Self {
        Self {
            prefix,
            next: if even { 0 } else { 1 },
            step: 2,
        }
    }

    /// Take the next counter value and its assembled nonce.
    pub fn next(&mut self) -> Result<(u64, Nonce), CryptoError> {
        let counter = self.next;
        self.next = self
            .next
            .checked_add(self.step)
            .ok_or(CryptoError::NonceExhausted)?;
        Ok((counter, counter_nonce(self.prefix, counter)))
    }
}

// ── Minute key ────────────────────────────────────────────────────────────────

/// Responder-local secret sealing cookies, rotated every 60 seconds.
///
/// The cookie is the only state a responder keeps about a hello, and
/// the minute key is what makes that safe: a cookie can only be
/// redeemed while the generation that sealed it is still live.
pub struct MinuteKey {
    key: Zeroizing<[u8; 32]>,
}

impl MinuteKey {
    pub fn generate() -> Self {
        Self {
            key: Zeroizing::new(random32()),
        }
    }

    fn cipher(&self) -> XSalsa20Poly1305 {
        XSalsa20Poly1305::new((&*self.key).into())
    }

    fn nonce(tail: &[u8; 16]) -> crypto_secretbox::Nonce {
        let mut raw = [0u8; 24];
        raw[..8].copy_from_slice(crate::wire::MINUTEKEY_NONCE_PREFIX);
        raw[8..].copy_from_slice(tail);
        raw.into()
    }

    /// Seal under the minute-key nonce prefix with a random 16-byte tail.
    pub fn seal(&self, plaintext: &[u8], tail: &[u8; 16]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .encrypt(&Self::nonce(tail), plaintext)
            .map_err(|_| CryptoError::BoxFailed)
    }

    pub fn open(&self, sealed: &[u8], tail: &[u8; 16]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .decrypt(&Self::nonce(tail), sealed)
            .map_err(|_| CryptoError::BoxAuth)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Unbox or signature rejection. Attacker-controlled path — callers
    /// drop silently, at most logging at debug level.
    #[error("box authentication failure")]
    BoxAuth,

    #[error("box encryption failed")]
    BoxFailed,

    #[error("nonce counter exhausted — the channel must be re-keyed")]
    NonceExhausted,

    #[error("identity seed must be 32 bytes, got {0}")]
    BadSeed(usize),

    #[error("identity file {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
