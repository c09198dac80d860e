//! passage-rendezvous — the registration/rendezvous protocol: a
//! cookie-challenged, signature-authenticated directory with keyword
//! search and hole-punch notification, plus the client that keeps a
//! node registered in it.

pub mod client;
pub mod proto;
pub mod server;

pub use client::{ClientEvent, ClientHandle, RegistrationClient, RoutingReceiver};
pub use server::RegistrationServer;
