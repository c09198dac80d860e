//! Client profile — the self-description a host publishes through a
//! rendezvous server.
//!
//! A profile is an ordered mapping of u32 attribute tags to byte
//! values. The upper 16 tag bits carry property flags; tags with the
//! `searchable` bit feed the server's keyword index. The tag space is
//! part of the registration protocol and grows append-only.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};

use crate::regcodec::{CodecError, Reader};

/// Attribute tags. The upper 16 bits are property flags.
pub mod tag {
    /// Search-worthy UTF-8 text; the server indexes its words.
    pub const SEARCHABLE: u32 = 0x0001_0000;

    /// Private endpoints for hole punching (binary, endpoint-encoded).
    pub const ENDPOINTS: u32 = 0x0000_0001;

    pub const HOSTNAME: u32 = 0x0001_0001;
    pub const OWNER_NICKNAME: u32 = 0x0001_0002;
    pub const CITY: u32 = 0x0001_0003;
    pub const REGION: u32 = 0x0001_0004;
    pub const COUNTRY: u32 = 0x0001_0005;
    pub const OWNER_FIRSTNAME: u32 = 0x0001_0006;
    pub const OWNER_LASTNAME: u32 = 0x0001_0007;
}

/// Minimum keyword length; shorter tokens are not indexed or matched.
pub const MIN_KEYWORD: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerProfile {
    attributes: BTreeMap<u32, Vec<u8>>,
}

impl PeerProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn attribute(&self, tag: u32) -> Option<&[u8]> {
        self.attributes.get(&tag).map(Vec::as_slice)
    }

    /// Set an attribute; an empty value removes it.
    pub fn set_attribute(&mut self, tag: u32, value: Vec<u8>) {
        if value.is_empty() {
            self.attributes.remove(&tag);
        } else {
            self.attributes.insert(tag, value);
        }
    }

    pub fn string(&self, tag: u32) -> Option<&str> {
        self.attribute(tag).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn set_string(&mut self, tag: u32, value: &str) {
        self.set_attribute(tag, value.as_bytes().to_vec());
    }

    // Typed accessors for the well-known tags.

    pub fn host_name(&self) -> Option<&str> {
        self.string(tag::HOSTNAME)
    }

    pub fn set_host_name(&mut self, v: &str) {
        self.set_string(tag::HOSTNAME, v);
    }

    pub fn owner_nickname(&self) -> Option<&str> {
        self.string(tag::OWNER_NICKNAME)
    }

    pub fn set_owner_nickname(&mut self, v: &str) {
        self.set_string(tag::OWNER_NICKNAME, v);
    }

    pub fn city(&self) -> Option<&str> {
        self.string(tag::CITY)
    }

    pub fn set_city(&mut self, v: &str) {
        self.set_string(tag::CITY, v);
    }

    pub fn region(&self) -> Option<&str> {
        self.string(tag::REGION)
    }

    pub fn set_region(&mut self, v: &str) {
        self.set_string(tag::REGION, v);
    }

    pub fn country(&self) -> Option<&str> {
        self.string(tag::COUNTRY)
    }

    pub fn set_country(&mut self, v: &str) {
        self.set_string(tag::COUNTRY, v);
    }

    /// Private endpoints advertised for hole punching.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        let Some(raw) = self.attribute(tag::ENDPOINTS) else {
            return Vec::new();
        };
        let mut r = Reader::new(raw);
        let Ok(count) = r.get_u32() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for _ in 0..count {
            match r.get_endpoint() {
                Ok(ep) => out.push(ep),
                Err(_) => return Vec::new(),
            }
        }
        out
    }

    pub fn set_endpoints(&mut self, endpoints: &[SocketAddr]) {
        let mut buf = BytesMut::new();
        buf.put_u32_le(endpoints.len() as u32);
        for ep in endpoints {
            match ep.ip() {
                std::net::IpAddr::V4(a) => {
                    buf.put_u8(4);
                    buf.put_slice(&a.octets());
                }
                std::net::IpAddr::V6(a) => {
                    buf.put_u8(6);
                    buf.put_slice(&a.octets());
                }
            }
            buf.put_u16_le(ep.port());
        }
        self.set_attribute(tag::ENDPOINTS, buf.to_vec());
    }

    /// All words appearing in searchable attributes, the keyword rule
    /// the server indexes by: whitespace-delimited tokens of at least
    /// [`MIN_KEYWORD`] characters.
    pub fn keywords(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (tag, value) in &self.attributes {
            if tag & tag::SEARCHABLE == 0 {
                continue;
            }
            let Ok(text) = std::str::from_utf8(value) else {
                continue;
            };
            out.extend(
                text.split_whitespace()
                    .filter(|w| w.len() >= MIN_KEYWORD)
                    .map(str::to_owned),
            );
        }
        out
    }

    // ── Encoding ──────────────────────────────────────────────────────────────

    /// Encode as a tagged attribute map: count, then (tag, value) pairs.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.attributes.len() as u32);
        for (tag, value) in &self.attributes {
            buf.put_u32_le(*tag);
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(value);
        }
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let count = r.get_u32()?;
        let mut profile = Self::new();
        for _ in 0..count {
            let tag = r.get_u32()?;
            let value = r.get_bytes()?.to_vec();
            profile.set_attribute(tag, value);
        }
        Ok(profile)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
