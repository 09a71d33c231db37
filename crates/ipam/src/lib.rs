//! Distributed IP address management.
//!
//! The configured CIDR is divided into a token ring of ownership
//! ranges, merged across peers through gossip. Each peer hands out
//! addresses only from ranges it owns, so two peers can never allocate
//! the same address once gossip has been delivered.

mod allocator;
mod claims;
mod ring;

pub use allocator::{
    quorum, Allocator, Config, Error, IpamCommand, IpamHandle, IpamStatus, CHANNEL,
    DEAD_PEER_THRESHOLD, DONATION_TIMEOUT,
};
pub use claims::Claims;
pub use ring::{Ring, RingError, Token};
