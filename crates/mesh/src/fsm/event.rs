//! State machine events.

use crate::fsm::{connmgr::Event as ConnMakerEvent, peermgr::Event as PeerEvent};
use crate::net::LocalTime;

/// A router event.
#[derive(Debug, Clone)]
pub enum Event {
    /// The router is initializing its state machine and about to start
    /// network activity.
    Initializing,
    /// The router is initialized and ready to receive commands.
    Ready {
        /// Local time.
        time: LocalTime,
    },
    /// A peer manager event.
    Peer(PeerEvent),
    /// A connection maker event.
    ConnMaker(ConnMakerEvent),
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(fmt, "Initializing"),
            Self::Ready { time } => write!(fmt, "Ready at {}", time),
            Self::Peer(event) => write!(fmt, "{}", event),
            Self::ConnMaker(event) => write!(fmt, "{}", event),
        }
    }
}

impl From<PeerEvent> for Event {
    fn from(e: PeerEvent) -> Self {
        Self::Peer(e)
    }
}

impl From<ConnMakerEvent> for Event {
    fn from(e: ConnMakerEvent) -> Self {
        Self::ConnMaker(e)
    }
}
