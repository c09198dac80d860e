//! Registration protocol messages.
//!
//! Every datagram is `REG_MAGIC(4) ‖ code(4) ‖ fields`, all integers
//! little-endian, fields in the registration codec. The first 8 bytes
//! double as the channel dispatcher's magic, which is how replies find
//! their way back through a node's packet fabric; every reply's first
//! field is the caller's hashed nonce, which is how they find the right
//! client.

use std::net::SocketAddr;

use bytes::Bytes;

use passage_core::crypto::Eid;
use passage_core::regcodec::{CodecError, Reader, Writer};

/// 'xROU' — the registration protocol magic.
pub const REG_MAGIC: u32 = 0x0052_4f55;

pub const REG_REQUEST: u32 = 0x100;
pub const REG_RESPONSE: u32 = 0x200;
pub const REG_NOTIFY: u32 = 0x300;

pub const OP_INSERT1: u32 = 0x00;
pub const OP_INSERT2: u32 = 0x01;
pub const OP_LOOKUP: u32 = 0x02;
pub const OP_SEARCH: u32 = 0x03;
pub const OP_DELETE: u32 = 0x04;

/// Search replies are truncated to this many IDs.
pub const MAX_RESULTS: usize = 100;

/// The 8-byte dispatcher magic for one protocol code.
pub fn dispatch_magic(code: u32) -> u64 {
    (REG_MAGIC as u64) | ((code as u64) << 32)
}

/// All codes a client expects back from a server.
pub const CLIENT_CODES: [u32; 6] = [
    REG_RESPONSE | OP_INSERT1,
    REG_RESPONSE | OP_INSERT2,
    REG_RESPONSE | OP_LOOKUP,
    REG_RESPONSE | OP_SEARCH,
    REG_RESPONSE | OP_DELETE,
    REG_NOTIFY | OP_LOOKUP,
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("bad registration magic")]
    BadMagic,

    #[error("unknown registration code {0:#x}")]
    UnknownCode(u32),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Read and validate the 8-byte header, returning the code and a
/// reader over the body.
pub fn read_header(buf: &[u8]) -> Result<(u32, Reader<'_>), ProtoError> {
    let mut r = Reader::new(buf);
    if r.get_u32()? != REG_MAGIC {
        return Err(ProtoError::BadMagic);
    }
    let code = r.get_u32()?;
    Ok((code, r))
}

/// Peek the hashed nonce leading every reply, for client-side routing.
pub fn response_nonce(buf: &[u8]) -> Option<[u8; 32]> {
    let (_, mut r) = read_header(buf).ok()?;
    r.get_array32().ok()
}

fn header(code: u32) -> Writer {
    let mut w = Writer::new();
    w.put_u32(REG_MAGIC).put_u32(code);
    w
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Insert1 {
        eid: Eid,
        hashed_nonce: [u8; 32],
    },
    Insert2 {
        eid: Eid,
        nonce: [u8; 32],
        challenge: [u8; 32],
        profile: Vec<u8>,
        pubkey: [u8; 32],
        signature: [u8; 64],
    },
    Lookup {
        eid: Eid,
        hashed_nonce: [u8; 32],
        target: Eid,
        notify: bool,
    },
    Search {
        eid: Eid,
        hashed_nonce: [u8; 32],
        text: String,
    },
    Delete {
        eid: Eid,
        hashed_nonce: [u8; 32],
    },
}

impl Request {
    pub fn encode(&self) -> Bytes {
        match self {
            Request::Insert1 { eid, hashed_nonce } => {
                let mut w = header(REG_REQUEST | OP_INSERT1);
                w.put_bytes(eid).put_bytes(hashed_nonce);
                w.finish()
            }
            Request::Insert2 {
                eid,
                nonce,
                challenge,
                profile,
                pubkey,
                signature,
            } => {
                let mut w = header(REG_REQUEST | OP_INSERT2);
                w.put_bytes(eid)
                    .put_bytes(nonce)
                    .put_bytes(challenge)
                    .put_bytes(profile)
                    .put_bytes(pubkey)
                    .put_bytes(signature);
                w.finish()
            }
            Request::Lookup {
                eid,
                hashed_nonce,
                target,
                notify,
            } => {
                let mut w = header(REG_REQUEST | OP_LOOKUP);
                w.put_bytes(eid)
                    .put_bytes(hashed_nonce)
                    .put_bytes(target)
                    .put_bool(*notify);
                w.finish()
            }
            Request::Search {
                eid,
                hashed_nonce,
                text,
            } => {
                let mut w = header(REG_REQUEST | OP_SEARCH);
                w.put_bytes(eid).put_bytes(hashed_nonce).put_str(text);
                w.finish()
            }
            Request::Delete { eid, hashed_nonce } => {
                let mut w = header(REG_REQUEST | OP_DELETE);
                w.put_bytes(eid).put_bytes(hashed_nonce);
                w.finish()
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (code, mut r) = read_header(buf)?;
        match code {
            c if c == REG_REQUEST | OP_INSERT1 => Ok(Request::Insert1 {
                eid: r.get_array32()?,
                hashed_nonce: r.get_array32()?,
            }),
            c if c == REG_REQUEST | OP_INSERT2 => Ok(Request::Insert2 {
                eid: r.get_array32()?,
                nonce: r.get_array32()?,
                challenge: r.get_array32()?,
                profile: r.get_bytes()?.to_vec(),
                pubkey: r.get_array32()?,
                signature: r.get_array64()?,
            }),
            c if c == REG_REQUEST | OP_LOOKUP => Ok(Request::Lookup {
                eid: r.get_array32()?,
                hashed_nonce: r.get_array32()?,
                target: r.get_array32()?,
                notify: r.get_bool()?,
            }),
            c if c == REG_REQUEST | OP_SEARCH => Ok(Request::Search {
                eid: r.get_array32()?,
                hashed_nonce: r.get_array32()?,
                text: r.get_str()?.to_string(),
            }),
            c if c == REG_REQUEST | OP_DELETE => Ok(Request::Delete {
                eid: r.get_array32()?,
                hashed_nonce: r.get_array32()?,
            }),
            other => Err(ProtoError::UnknownCode(other)),
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Insert1 {
        hashed_nonce: [u8; 32],
        challenge: [u8; 32],
    },
    Insert2 {
        hashed_nonce: [u8; 32],
        lifetime_secs: u32,
        public_ep: SocketAddr,
    },
    /// RESPONSE|LOOKUP and NOTIFY|LOOKUP share a body; `notify`
    /// distinguishes the codes.
    Lookup {
        hashed_nonce: [u8; 32],
        target: Eid,
        known: bool,
        ep: Option<SocketAddr>,
        profile: Vec<u8>,
        notify: bool,
    },
    Search {
        hashed_nonce: [u8; 32],
        text: String,
        complete: bool,
        ids: Vec<Eid>,
    },
    Delete {
        hashed_nonce: [u8; 32],
        was_deleted: bool,
    },
}

impl Response {
    pub fn encode(&self) -> Bytes {
        match self {
            Response::Insert1 {
                hashed_nonce,
                challenge,
            } => {
                let mut w = header(REG_RESPONSE | OP_INSERT1);
                w.put_bytes(hashed_nonce).put_bytes(challenge);
                w.finish()
            }
            Response::Insert2 {
                hashed_nonce,
                lifetime_secs,
                public_ep,
            } => {
                let mut w = header(REG_RESPONSE | OP_INSERT2);
                w.put_bytes(hashed_nonce)
                    .put_u32(*lifetime_secs)
                    .put_endpoint(*public_ep);
                w.finish()
            }
            Response::Lookup {
                hashed_nonce,
                target,
                known,
                ep,
                profile,
                notify,
            } => {
                let base = if *notify { REG_NOTIFY } else { REG_RESPONSE };
                let mut w = header(base | OP_LOOKUP);
                w.put_bytes(hashed_nonce).put_bytes(target).put_bool(*known);
                if *known {
                    w.put_endpoint(ep.expect("known lookup has an endpoint"));
                    w.put_bytes(profile);
                }
                w.finish()
            }
            Response::Search {
                hashed_nonce,
                text,
                complete,
                ids,
            } => {
                let mut w = header(REG_RESPONSE | OP_SEARCH);
                w.put_bytes(hashed_nonce)
                    .put_str(text)
                    .put_bool(*complete)
                    .put_u32(ids.len() as u32);
                for id in ids {
                    w.put_bytes(id);
                }
                w.finish()
            }
            Response::Delete {
                hashed_nonce,
                was_deleted,
            } => {
                let mut w = header(REG_RESPONSE | OP_DELETE);
                w.put_bytes(hashed_nonce).put_bool(*was_deleted);
                w.finish()
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (code, mut r) = read_header(buf)?;
        match code {
            c if c == REG_RESPONSE | OP_INSERT1 => Ok(Response::Insert1 {
                hashed_nonce: r.get_array32()?,
                challenge: r.get_array32()?,
            }),
            c if c == REG_RESPONSE | OP_INSERT2 => Ok(Response::Insert2 {
                hashed_nonce: r.get_array32()?,
                lifetime_secs: r.get_u32()?,
                public_ep: r.get_endpoint()?,
            }),
            c if c == REG_RESPONSE | OP_LOOKUP || c == REG_NOTIFY | OP_LOOKUP => {
                let hashed_nonce = r.get_array32()?;
                let target = r.get_array32()?;
                let known = r.get_bool()?;
                let (ep, profile) = if known {
                    (Some(r.get_endpoint()?), r.get_bytes()?.to_vec())
                } else {
                    (None, Vec::new())
                };
                Ok(Response::Lookup {
                    hashed_nonce,
                    target,
                    known,
                    ep,
                    profile,
                    notify: code == REG_NOTIFY | OP_LOOKUP,
                })
            }
            c if c == REG_RESPONSE | OP_SEARCH => {
                let hashed_nonce = r.get_array32()?;
                let text = r.get_str()?.to_string();
                let complete = r.get_bool()?;
                let count = r.get_u32()? as usize;
                if count > MAX_RESULTS {
                    return Err(ProtoError::Codec(CodecError::Oversize(count)));
                }
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(r.get_array32()?);
                }
                Ok(Response::Search {
                    hashed_nonce,
                    text,
                    complete,
                    ids,
                })
            }
            c if c == REG_RESPONSE | OP_DELETE => Ok(Response::Delete {
                hashed_nonce: r.get_array32()?,
                was_deleted: r.get_bool()?,
            }),
            other => Err(ProtoError::UnknownCode(other)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
