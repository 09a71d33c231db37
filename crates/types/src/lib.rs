//! Shared types for the mesh router: peer identity, Ethernet addresses
//! and the framed wire protocol spoken between peers.

mod mac;
mod peer;

pub mod message;
pub mod wire;

pub use mac::Mac;
pub use peer::{ConnectionSummary, Peer, PeerName, PeerUid};

/// TCP and UDP port the router listens on unless overridden.
pub const DEFAULT_PORT: u16 = 6783;

/// Protocol tag exchanged in the greeting.
pub const PROTOCOL_TAG: &str = "weave";

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
