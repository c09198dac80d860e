//! passage-node — the host-side runtime: packet dispatch, channels,
//! key exchange, peer coordination, and the socket surface (real UDP
//! and the simulated network used in tests).

pub mod channel;
pub mod dispatch;
pub mod kex;
pub mod node;
pub mod peer;
pub mod receiver;
pub mod sim;
pub mod socket;

pub use channel::{Channel, ChannelError, ChannelEvents};
pub use node::{Node, NodeEvent, SocketId};
pub use socket::{Socket, UdpTransport};
