//! The four-message key exchange: Hello / Cookie / Initiate / Message.
//!
//! The responder side is stateless until a valid Initiate arrives; the
//! initiator side is one state machine per outstanding attempt. Both
//! speak the packet layouts in `passage_core::wire`.

mod initiator;
mod responder;

pub use initiator::{Initiator, InitiatorIndex, Outcome};
pub use responder::{IncomingChannel, Responder};

use std::time::Duration;

/// First retransmit delay.
pub const RETRANSMIT_INITIAL: Duration = Duration::from_secs(1);

/// Backoff factor applied after every retransmission.
pub const RETRANSMIT_FACTOR: f64 = 1.5;

/// Failed attempts before an initiator gives up.
pub const MAX_ATTEMPTS: u32 = 5;

/// How long an initiator trusts a received cookie before falling back
/// to Hello. Matches the responder's rotation period, so a cookie older
/// than this may already be sealed under an evicted generation.
pub const COOKIE_LIFETIME: Duration = Duration::from_secs(60);

/// Responder minute-key rotation period.
pub const MINUTE_KEY_ROTATION: Duration = Duration::from_secs(60);
