//! Passage wire format — on-wire layouts for the channel protocol.
//!
//! These types ARE the protocol. Every field, every size, every padding
//! byte is part of the wire format and fixed for interoperability.
//!
//! All types are #[repr(C, packed)] for deterministic layout and use
//! zerocopy derives for safe, allocation-free serialization. Multi-byte
//! integers are explicit little-endian (`U64<LittleEndian>`). There is
//! no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Little-endian u64 wire field.
pub type U64Le = U64<LittleEndian>;

// ── Packet magics ─────────────────────────────────────────────────────────────

/// First 8 bytes of every channel-protocol datagram, read little-endian.
/// The ASCII spellings are a debugging aid; the numeric values are the
/// contract.
pub const HELLO_MAGIC: u64 = 0x7156_4e71_3578_4c68; // "qVNq5xLh"
pub const COOKIE_MAGIC: u64 = 0x726c_3341_6e6d_786b; // "rl3Anmxk"
pub const INITIATE_MAGIC: u64 = 0x7156_4e71_3578_4c69; // "qVNq5xLi"
pub const MESSAGE_MAGIC: u64 = 0x726c_3371_3578_4c6d; // "rl3q5xLm"

// ── Size constants ────────────────────────────────────────────────────────────

/// Maximum transport unit — the IPv6 unfragmented MTU.
pub const MTU: usize = 1280;

/// Datagrams below this size are silently dropped before any parsing.
pub const MIN_PACKET: usize = 64;

/// Default UDP port for channel traffic.
pub const CHANNEL_PORT: u16 = 9660;

/// Default UDP port of a rendezvous server.
pub const REGSERVER_PORT: u16 = 9669;

/// Poly1305 tag appended by every box and secretbox.
pub const BOX_OVERHEAD: usize = 16;

pub const HELLO_PACKET_SIZE: usize = 192;
pub const COOKIE_PACKET_SIZE: usize = 168;
pub const INITIATE_HEADER_SIZE: usize = 144;
pub const MESSAGE_HEADER_SIZE: usize = 48;

/// Fixed prefix of the Initiate inner plaintext:
/// long-term key (32) + vouch nonce (16) + vouch box (48).
pub const INITIATE_INNER_SIZE: usize = 96;

/// Largest application payload that fits a MESSAGE within the MTU.
pub const MAX_MESSAGE_PAYLOAD: usize = MTU - MESSAGE_HEADER_SIZE - BOX_OVERHEAD;

/// Largest payload that fits the Initiate inner box within the MTU.
pub const MAX_INITIATE_PAYLOAD: usize =
    MTU - INITIATE_HEADER_SIZE - BOX_OVERHEAD - INITIATE_INNER_SIZE;

// ── Nonce prefixes ────────────────────────────────────────────────────────────

// Fixed ASCII prefixes namespacing each box direction, so the same key
// pair never reuses a nonce across roles. 16-byte prefixes carry an
// 8-byte little-endian counter tail; 8-byte prefixes carry a 16-byte
// random tail.

pub const HELLO_NONCE_PREFIX: &[u8; 16] = b"cUVVYcp-CLIENT-h";
pub const INITIATE_NONCE_PREFIX: &[u8; 16] = b"cUVVYcp-CLIENT-i";
pub const MESSAGE_NONCE_PREFIX: &[u8; 16] = b"cUVVYcp-CLIENT-m";
pub const COOKIE_NONCE_PREFIX: &[u8; 8] = b"cUVVYcpk";
pub const VOUCH_NONCE_PREFIX: &[u8; 8] = b"cUVVYcpv";
pub const MINUTEKEY_NONCE_PREFIX: &[u8; 8] = b"minute-k";

// ── Packet layouts ────────────────────────────────────────────────────────────

/// Hello — first message of the key exchange, initiator → responder.
///
/// The 64 zero bytes equalize the packet size against application
/// traffic and leave room for future extension; receivers require them
/// to be zero. The box decrypts under (initiator_short_pk,
/// responder_long_sk) to the initiator's long-term key followed by 32
/// zero bytes.
///
/// Wire size: 192 bytes.
#[derive(Debug, Clone, PartialEq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HelloPacket {
    pub magic: U64Le,
    pub initiator_short_pk: [u8; 32],
    pub padding: [u8; 64],
    pub nonce: U64Le,
    pub sealed: [u8; 80],
}

assert_eq_size!(HelloPacket, [u8; HELLO_PACKET_SIZE]);

/// Cookie — responder → initiator, carrying no responder state.
///
/// The box decrypts under (responder_long_pk, initiator_short_sk) to
/// the responder's fresh short-term public key (32), the minute-key
/// nonce (16), and the 80-byte minute cookie the initiator must echo.
///
/// Wire size: 168 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct CookiePacket {
    pub magic: U64Le,
    pub nonce: [u8; 16],
    pub sealed: [u8; 144],
}

assert_eq_size!(CookiePacket, [u8; COOKIE_PACKET_SIZE]);

/// Initiate header — initiator → responder, followed by a variable box.
///
/// `cookie_nonce` and `cookie_sealed` echo the minute cookie exactly as
/// received; only the responder can open them. The variable box after
/// the header decrypts to an [`InitiateInner`] prefix plus payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct InitiateHeader {
    pub magic: U64Le,
    pub initiator_short_pk: [u8; 32],
    pub cookie_nonce: [u8; 16],
    pub cookie_sealed: [u8; 80],
    pub nonce: U64Le,
}

assert_eq_size!(InitiateHeader, [u8; INITIATE_HEADER_SIZE]);

/// Fixed prefix of the decrypted Initiate inner plaintext.
///
/// The vouch box is sealed under (responder_long_pk, initiator_long_sk)
/// and contains the initiator's short-term public key — the binding that
/// proves the short-term key belongs to the claimed long-term identity.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct InitiateInner {
    pub initiator_long_pk: [u8; 32],
    pub vouch_nonce: [u8; 16],
    pub vouch_sealed: [u8; 48],
}

assert_eq_size!(InitiateInner, [u8; INITIATE_INNER_SIZE]);

/// Message header — either direction, followed by a variable box.
///
/// `sender_short_pk` indexes the receiving host's channel table; the
/// box decrypts under the channel's short-term pair with the carried
/// nonce counter.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader {
    pub magic: U64Le,
    pub sender_short_pk: [u8; 32],
    pub nonce: U64Le,
}

assert_eq_size!(MessageHeader, [u8; MESSAGE_HEADER_SIZE]);

// ── Parsing helpers ───────────────────────────────────────────────────────────

/// Read the dispatch magic from a datagram.
///
/// Returns None for datagrams below [`MIN_PACKET`] — the caller must
/// silently drop those without further inspection.
pub fn packet_magic(buf: &[u8]) -> Option<u64> {
    if buf.len() < MIN_PACKET {
        return None;
    }
    Some(u64::from_le_bytes(buf[..8].try_into().unwrap()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
///
/// Every variant is an attacker-reachable condition and maps to a
/// silent drop at the dispatch layer; the type exists so inner layers
/// can log at debug level before discarding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is below the {MIN_PACKET}-byte minimum")]
    Undersize(usize),

    #[error("wrong packet size {got}, expected {expected}")]
    WrongSize { got: usize, expected: usize },

    #[error("truncated packet: {0} bytes")]
    Truncated(usize),

    #[error("payload of {0} bytes exceeds the MTU budget")]
    PayloadTooLarge(usize),

    #[error("hello padding is not zeroed")]
    DirtyPadding,
}

impl HelloPacket {
    /// Parse a HELLO datagram. The size must be exact and the padding
    /// bytes must all be zero.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != HELLO_PACKET_SIZE {
            return Err(WireError::WrongSize {
                got: buf.len(),
                expected: HELLO_PACKET_SIZE,
            });
        }
        let pkt = Self::read_from(buf).ok_or(WireError::Truncated(buf.len()))?;
        if pkt.padding != [0u8; 64] {
            return Err(WireError::DirtyPadding);
        }
        Ok(pkt)
    }
}

impl CookiePacket {
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != COOKIE_PACKET_SIZE {
            return Err(WireError::WrongSize {
                got: buf.len(),
                expected: COOKIE_PACKET_SIZE,
            });
        }
        Self::read_from(buf).ok_or(WireError::Truncated(buf.len()))
    }
}

impl InitiateHeader {
    /// Parse an INITIATE datagram, returning the header and the sealed
    /// tail. The tail must hold at least the inner prefix plus a tag.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if buf.len() > MTU {
            return Err(WireError::PayloadTooLarge(buf.len()));
        }
        let min = INITIATE_HEADER_SIZE + INITIATE_INNER_SIZE + BOX_OVERHEAD;
        if buf.len() < min {
            return Err(WireError::Truncated(buf.len()));
        }
        let hdr = Self::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;
        Ok((hdr, &buf[INITIATE_HEADER_SIZE..]))
    }
}

impl MessageHeader {
    /// Parse a MESSAGE datagram, returning the header and the sealed
    /// tail (possibly an empty payload — 16 tag bytes only).
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if buf.len() > MTU {
            return Err(WireError::PayloadTooLarge(buf.len()));
        }
        if buf.len() < MESSAGE_HEADER_SIZE + BOX_OVERHEAD {
            return Err(WireError::Truncated(buf.len()));
        }
        let hdr = Self::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;
        Ok((hdr, &buf[MESSAGE_HEADER_SIZE..]))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::AsBytes;

    #[test]
    fn magics_spell_their_ascii_names() {
        assert_eq!(&HELLO_MAGIC.to_be_bytes(), b"qVNq5xLh");
        assert_eq!(&COOKIE_MAGIC.to_be_bytes(), b"rl3Anmxk");
        assert_eq!(&INITIATE_MAGIC.to_be_bytes(), b"qVNq5xLi");
        assert_eq!(&MESSAGE_MAGIC.to_be_bytes(), b"rl3q5xLm");
    }

    #[test]
    fn magics_are_distinct() {
        let magics = [HELLO_MAGIC, COOKIE_MAGIC, INITIATE_MAGIC, MESSAGE_MAGIC];
        for (i, a) in magics.iter().enumerate() {
            for b in &magics[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn hello_round_trip() {
        let original = HelloPacket {
            magic: U64Le::new(HELLO_MAGIC),
            initiator_short_pk: [0xab; 32],
            padding: [0u8; 64],
            nonce: U64Le::new(7),
            sealed: [0xcd; 80],
        };
        let bytes = original.as_bytes();
        assert_eq!(bytes.len(), HELLO_PACKET_SIZE);
        // Magic occupies the first 8 bytes, little-endian.
        assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), HELLO_MAGIC);

        let recovered = HelloPacket::parse(bytes).unwrap();
        assert_eq!(recovered.initiator_short_pk, original.initiator_short_pk);
        assert_eq!(recovered.nonce.get(), 7);
        assert_eq!(recovered.sealed, original.sealed);
    }

    #[test]
    fn hello_rejects_dirty_padding() {
        let mut pkt = HelloPacket {
            magic: U64Le::new(HELLO_MAGIC),
            initiator_short_pk: [0; 32],
            padding: [0u8; 64],
            nonce: U64Le::new(0),
            sealed: [0; 80],
        };
        pkt.padding[13] = 1;
        assert_eq!(
            HelloPacket::parse(pkt.as_bytes()),
            Err(WireError::DirtyPadding)
        );
    }

    #[test]
    fn hello_rejects_wrong_size() {
        let buf = [0u8; HELLO_PACKET_SIZE - 1];
        assert!(matches!(
            HelloPacket::parse(&buf),
            Err(WireError::WrongSize { .. })
        ));
    }

    #[test]
    fn cookie_round_trip() {
        let original = CookiePacket {
            magic: U64Le::new(COOKIE_MAGIC),
            nonce: [0x11; 16],
            sealed: [0x22; 144],
        };
        let bytes = original.as_bytes();
        assert_eq!(bytes.len(), COOKIE_PACKET_SIZE);
        let recovered = CookiePacket::parse(bytes).unwrap();
        assert_eq!(recovered.nonce, original.nonce);
        assert_eq!(recovered.sealed, original.sealed);
    }

    #[test]
    fn initiate_parse_splits_header_and_tail() {
        let hdr = InitiateHeader {
            magic: U64Le::new(INITIATE_MAGIC),
            initiator_short_pk: [0x33; 32],
            cookie_nonce: [0x44; 16],
            cookie_sealed: [0x55; 80],
            nonce: U64Le::new(3),
        };
        let mut buf = hdr.as_bytes().to_vec();
        buf.extend_from_slice(&[0x66; INITIATE_INNER_SIZE + BOX_OVERHEAD + 10]);

        let (recovered, tail) = InitiateHeader::parse(&buf).unwrap();
        assert_eq!(recovered.initiator_short_pk, hdr.initiator_short_pk);
        assert_eq!(recovered.cookie_sealed, hdr.cookie_sealed);
        assert_eq!(tail.len(), INITIATE_INNER_SIZE + BOX_OVERHEAD + 10);
    }

    #[test]
    fn initiate_rejects_short_tail() {
        let buf = [0u8; INITIATE_HEADER_SIZE + INITIATE_INNER_SIZE + BOX_OVERHEAD - 1];
        assert!(matches!(
            InitiateHeader::parse(&buf),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn message_parse_minimum_is_64_bytes() {
        // Empty payload: header + tag only. This is also MIN_PACKET,
        // so the zero-payload ack survives the dispatcher's size gate.
        assert_eq!(MESSAGE_HEADER_SIZE + BOX_OVERHEAD, MIN_PACKET);

        let hdr = MessageHeader {
            magic: U64Le::new(MESSAGE_MAGIC),
            sender_short_pk: [0x77; 32],
            nonce: U64Le::new(5),
        };
        let mut buf = hdr.as_bytes().to_vec();
        buf.extend_from_slice(&[0u8; BOX_OVERHEAD]);

        let (recovered, tail) = MessageHeader::parse(&buf).unwrap();
        assert_eq!(recovered.sender_short_pk, hdr.sender_short_pk);
        assert_eq!(recovered.nonce.get(), 5);
        assert_eq!(tail.len(), BOX_OVERHEAD);
    }

    #[test]
    fn message_rejects_oversize() {
        let buf = vec![0u8; MTU + 1];
        assert!(matches!(
            MessageHeader::parse(&buf),
            Err(WireError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn packet_magic_drops_undersize() {
        assert_eq!(packet_magic(&[0u8; MIN_PACKET - 1]), None);

        let mut buf = vec![0u8; MIN_PACKET];
        buf[..8].copy_from_slice(&MESSAGE_MAGIC.to_le_bytes());
        assert_eq!(packet_magic(&buf), Some(MESSAGE_MAGIC));
    }

    #[test]
    fn payload_budgets_fit_the_mtu() {
        assert_eq!(
            MESSAGE_HEADER_SIZE + MAX_MESSAGE_PAYLOAD + BOX_OVERHEAD,
            MTU
        );
        assert_eq!(
            INITIATE_HEADER_SIZE + INITIATE_INNER_SIZE + MAX_INITIATE_PAYLOAD + BOX_OVERHEAD,
            MTU
        );
    }
}
