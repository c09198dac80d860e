//! Length-prefixed tagged encoding for the registration protocol.
//!
//! Both the rendezvous client and server consume exactly this codec:
//! u32-LE scalars, u32-length-prefixed byte fields, UTF-8 strings,
//! booleans as one byte, and socket endpoints as family + address +
//! port. Field lengths are capped so a hostile datagram cannot force a
//! large allocation.
//!
//! Registration datagrams are zero-padded up to the channel dispatcher's
//! 64-byte minimum; readers treat trailing bytes as padding.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::wire::MIN_PACKET;

/// Largest single field a reader will accept. Generous for profiles,
/// far below anything that could stress the allocator.
pub const MAX_FIELD: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated field")]
    Truncated,

    #[error("field of {0} bytes exceeds the {MAX_FIELD}-byte cap")]
    Oversize(usize),

    #[error("field is not valid UTF-8")]
    BadUtf8,

    #[error("unknown endpoint family {0}")]
    BadFamily(u8),

    #[error("boolean byte must be 0 or 1, got {0}")]
    BadBool(u8),
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Builds one registration datagram.
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(v as u8);
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        debug_assert!(v.len() <= MAX_FIELD);
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn put_endpoint(&mut self, ep: SocketAddr) -> &mut Self {
        match ep.ip() {
            IpAddr::V4(a) => {
                self.buf.put_u8(4);
                self.buf.put_slice(&a.octets());
            }
            IpAddr::V6(a) => {
                self.buf.put_u8(6);
                self.buf.put_slice(&a.octets());
            }
        }
        self.buf.put_u16_le(ep.port());
        self
    }

    /// Finish the datagram, zero-padding to the dispatcher minimum.
    pub fn finish(mut self) -> Bytes {
        if self.buf.len() < MIN_PACKET {
            self.buf.resize(MIN_PACKET, 0);
        }
        self.buf.freeze()
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Consumes one registration datagram. Trailing padding is ignored.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        if self.buf.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        Ok(self.buf.get_u32_le())
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        if self.buf.remaining() < 1 {
            return Err(CodecError::Truncated);
        }
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::BadBool(other)),
        }
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.get_u32()? as usize;
        if len > MAX_FIELD {
            return Err(CodecError::Oversize(len));
        }
        if self.buf.remaining() < len {
            return Err(CodecError::Truncated);
        }
        let (field, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(field)
    }

    /// Fixed 32-byte field (EIDs, nonces, challenges).
    pub fn get_array32(&mut self) -> Result<[u8; 32], CodecError> {
        let field = self.get_bytes()?;
        field.try_into().map_err(|_| CodecError::Truncated)
    }

    /// Fixed 64-byte field (signatures).
    pub fn get_array64(&mut self) -> Result<[u8; 64], CodecError> {
        let field = self.get_bytes()?;
        field.try_into().map_err(|_| CodecError::Truncated)
    }

    pub fn get_str(&mut self) -> Result<&'a str, CodecError> {
        std::str::from_utf8(self.get_bytes()?).map_err(|_| CodecError::BadUtf8)
    }

    pub fn get_endpoint(&mut self) -> Result<SocketAddr, CodecError> {
        if self.buf.remaining() < 1 {
            return Err(CodecError::Truncated);
        }
        let ip: IpAddr = match self.buf.get_u8() {
            4 => {
                if self.buf.remaining() < 4 {
                    return Err(CodecError::Truncated);
                }
                let mut octets = [0u8; 4];
                self.buf.copy_to_slice(&mut octets);
                Ipv4Addr::from(octets).into()
            }
            6 => {
                if self.buf.remaining() < 16 {
                    return Err(CodecError::Truncated);
                }
                let mut octets = [0u8; 16];
                self.buf.copy_to_slice(&mut octets);
                Ipv6Addr::from(octets).into()
            }
            other => return Err(CodecError::BadFamily(other)),
        };
        if self.buf.remaining() < 2 {
            return Err(CodecError::Truncated);
        }
        let port = self.buf.get_u16_le();
        Ok(SocketAddr::new(ip, port))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
