//! Connection lifecycle and handshake management.
//!
//! A connection moves through: TCP connected, greeting exchanged
//! (*greeted*), first heartbeat round-trip confirmed (*established*).
//! Rejections at the greeting stage fail only the offending
//! connection.

use std::collections::HashMap;
use std::net::SocketAddr;

use weave_types::message::Greeting;
use weave_types::{PeerName, PeerUid};

use crate::crypto::{Keypair, Session};
use crate::fsm::handler::DisconnectReason;
use crate::net::{Disconnect as NetDisconnect, Link, LocalDuration, LocalTime};
use crate::net::time::Clock;

use super::output::{Disconnect, SetTimer, Wire};

/// Time to wait for the remote greeting, and then for the heartbeat
/// round-trip, before giving up on the connection.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);
/// Time to wait for an outgoing TCP connect to complete.
pub const CONNECTION_TIMEOUT: LocalDuration = LocalDuration::from_secs(6);
/// Default cap on concurrent connections.
pub const DEFAULT_CONN_LIMIT: usize = 128;

/// An event originating in the peer manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new connection was set up. Triggered before the handshake.
    Connected(SocketAddr, Link),
    /// The remote's greeting was accepted.
    Greeted {
        addr: SocketAddr,
        name: PeerName,
        nick_name: String,
    },
    /// The heartbeat round-trip completed; the connection counts for
    /// routing now.
    Established { addr: SocketAddr, name: PeerName },
    /// A connection attempt failed.
    ConnectionFailed(SocketAddr, std::sync::Arc<std::io::Error>),
    /// A peer was disconnected.
    Disconnected(SocketAddr, NetDisconnect<DisconnectReason>),
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(addr, link) => write!(fmt, "{}: Peer connected ({:?})", addr, link),
            Self::Greeted {
                addr,
                name,
                nick_name,
            } => write!(fmt, "{}: Peer {} ({}) greeted", addr, name, nick_name),
            Self::Established { addr, name } => {
                write!(fmt, "{}: Peer {} established", addr, name)
            }
            Self::ConnectionFailed(addr, err) => {
                write!(fmt, "{}: Peer connection attempt failed: {}", addr, err)
            }
            Self::Disconnected(addr, reason) => {
                write!(fmt, "Disconnected from {} ({})", addr, reason)
            }
        }
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Our name.
    pub name: PeerName,
    /// Our human-friendly nickname, carried in the greeting.
    pub nick_name: String,
    /// Our incarnation id.
    pub uid: PeerUid,
    /// UDP port we receive frames and heartbeats on.
    pub udp_port: u16,
    /// Cluster password. Encryption is all-or-nothing: a greeting
    /// whose expectation differs is rejected.
    pub password: Option<String>,
    /// Cap on concurrent connections.
    pub conn_limit: usize,
}

/// Peer negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for the heartbeat round-trip to complete.
    Greeted { since: LocalTime },
    /// Fully established.
    Established { since: LocalTime },
}

/// A peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Remote socket address.
    pub addr: SocketAddr,
    /// Local address of the connection.
    pub local_addr: SocketAddr,
    /// Whether this is an inbound or outbound connection.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
}

/// Peer information, available once the greeting arrived.
#[derive(Debug)]
pub struct PeerInfo {
    pub name: PeerName,
    pub uid: PeerUid,
    pub nick_name: String,
    /// Where the peer receives UDP datagrams.
    pub udp_addr: SocketAddr,
    state: HandshakeState,
    /// Session encryption state, when a password is configured.
    pub session: Option<Session>,
}

impl PeerInfo {
    pub fn is_established(&self) -> bool {
        matches!(self.state, HandshakeState::Established { .. })
    }
}

/// Per-connection state.
#[derive(Debug)]
enum PeerConn {
    /// A connection is being attempted.
    Connecting { time: LocalTime },
    /// A connection is set up.
    Connected {
        conn: Connection,
        /// Ephemeral key material awaiting the remote greeting.
        keypair: Option<Keypair>,
        /// Peer information, if a greeting was received.
        peer: Option<PeerInfo>,
    },
}

/// Result of a successfully processed greeting.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub name: PeerName,
    pub nick_name: String,
    pub udp_addr: SocketAddr,
    pub link: Link,
    /// The address worth gossiping for this peer: its listening
    /// address, known only when we dialed it.
    pub advertised_addr: Option<SocketAddr>,
}

/// Manages peer connections and the handshake.
#[derive(Debug)]
pub struct PeerManager<U, C> {
    pub config: Config,
    peers_storage: HashMap<SocketAddr, PeerConn>,
    /// Reverse index from a peer's UDP endpoint to its connection.
    udp_index: HashMap<SocketAddr, SocketAddr>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer + Disconnect, C: Clock> PeerManager<U, C> {
    pub fn new(config: Config, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            config,
            peers_storage: HashMap::new(),
            udp_index: HashMap::new(),
            upstream,
            rng,
            clock,
        }
    }

    /// Called when an outgoing connection attempt is underway.
    pub fn peer_attempted(&mut self, addr: &SocketAddr) {
        let time = self.clock.local_time();
        self.peers_storage
            .entry(*addr)
            .or_insert(PeerConn::Connecting { time });
    }

    /// Called when a peer connected. Sends our greeting.
    pub fn peer_connected(&mut self, addr: SocketAddr, local_addr: SocketAddr, link: Link) {
        let local_time = self.clock.local_time();

        let keypair = self
            .config
            .password
            .is_some()
            .then(|| Keypair::generate(&mut self.rng));

        let greeting = Greeting {
            name: self.config.name,
            uid: self.config.uid,
            nick_name: self.config.nick_name.clone(),
            udp_port: self.config.udp_port,
            public_key: keypair.as_ref().map(Keypair::public_bytes),
        };

        self.peers_storage.insert(
            addr,
            PeerConn::Connected {
                conn: Connection {
                    addr,
                    local_addr,
                    link,
                    since: local_time,
                },
                keypair,
                peer: None,
            },
        );

        self.upstream.greeting(addr, greeting);
        // Set a timeout for receiving the remote greeting.
        self.upstream.set_timer(HANDSHAKE_TIMEOUT);
        self.upstream.event(Event::Connected(addr, link));
    }

    /// Called when the remote greeting was received.
    pub fn received_greeting(
        &mut self,
        addr: &SocketAddr,
        greeting: Greeting,
    ) -> Result<Option<Negotiated>, DisconnectReason> {
        let now = self.clock.local_time();

        let greeted_count = self.greeted().count();

        // Find a duplicate connection to the same peer, if any, before
        // borrowing this connection mutably.
        let duplicate = self.peers_storage.iter().find_map(|(a, c)| match c {
            PeerConn::Connected {
                conn,
                peer: Some(peer),
                ..
            } if *a != *addr && peer.name == greeting.name => Some((*a, conn.link)),
            _ => None,
        });

        let Some(PeerConn::Connected {
            conn,
            keypair,
            peer,
        }) = self.peers_storage.get_mut(addr)
        else {
            return Ok(None);
        };

        if peer.is_some() {
            return Err(DisconnectReason::ProtocolViolation(
                "greeting received twice",
            ));
        }
        if greeting.name == self.config.name {
            return Err(DisconnectReason::SelfConnection);
        }
        if greeting.public_key.is_some() != self.config.password.is_some() {
            // A mixed cluster is refused outright, before any
            // authenticated bytes are exchanged.
            return Err(DisconnectReason::EncryptionMismatch);
        }
        if greeted_count >= self.config.conn_limit {
            // Connections beyond the cap are refused once the remote
            // has identified itself.
            return Err(DisconnectReason::ConnectionLimit);
        }

        let link = conn.link;
        let udp_addr = SocketAddr::new(conn.addr.ip(), greeting.udp_port);

        // Both sides of a simultaneous connect run the same
        // comparison, so exactly one connection survives: the one
        // whose (initiator, acceptor) name pair is smaller.
        if let Some((other_addr, other_link)) = duplicate {
            let ours = Self::name_pair(self.config.name, greeting.name, link);
            let theirs = Self::name_pair(self.config.name, greeting.name, other_link);

            if ours < theirs {
                self.upstream
                    .disconnect(other_addr, DisconnectReason::DuplicateConnection);
            } else {
                return Err(DisconnectReason::DuplicateConnection);
            }
        }

        let session = match (&self.config.password, greeting.public_key) {
            (Some(password), Some(public_key)) => {
                let keypair = keypair.take().expect("keypair is generated with a password");
                Some(Session::new(
                    keypair,
                    public_key,
                    password,
                    self.config.name,
                    greeting.name,
                ))
            }
            _ => None,
        };

        let negotiated = Negotiated {
            name: greeting.name,
            nick_name: greeting.nick_name.clone(),
            udp_addr,
            link,
            advertised_addr: link.is_outbound().then_some(conn.addr),
        };

        *peer = Some(PeerInfo {
            name: greeting.name,
            uid: greeting.uid,
            nick_name: greeting.nick_name,
            udp_addr,
            state: HandshakeState::Greeted { since: now },
            session,
        });
        self.udp_index.insert(udp_addr, *addr);

        // The heartbeat round-trip must complete within the handshake
        // window too.
        self.upstream.set_timer(HANDSHAKE_TIMEOUT);
        self.upstream.event(Event::Greeted {
            addr: *addr,
            name: negotiated.name,
            nick_name: negotiated.nick_name.clone(),
        });

        Ok(Some(negotiated))
    }

    /// Called when a `ConnectionEstablished` message was received: the
    /// remote has seen our UDP heartbeats. Returns the peer name on
    /// the first transition.
    pub fn connection_established(&mut self, addr: &SocketAddr) -> Option<PeerName> {
        let now = self.clock.local_time();

        match self.peers_storage.get_mut(addr) {
            Some(PeerConn::Connected {
                peer: Some(peer), ..
            }) => match peer.state {
                HandshakeState::Greeted { .. } => {
                    peer.state = HandshakeState::Established { since: now };
                    self.upstream.event(Event::Established {
                        addr: *addr,
                        name: peer.name,
                    });
                    Some(peer.name)
                }
                HandshakeState::Established { .. } => None,
            },
            Some(PeerConn::Connected { peer: None, .. }) => {
                self.upstream.disconnect(
                    *addr,
                    DisconnectReason::ProtocolViolation("`established` before greeting"),
                );
                None
            }
            _ => None,
        }
    }

    /// Called when a peer disconnected. Returns the peer's name and
    /// whether the connection had been established.
    pub fn peer_disconnected(
        &mut self,
        addr: &SocketAddr,
        reason: NetDisconnect<DisconnectReason>,
    ) -> Option<(PeerName, bool)> {
        let result = match self.peers_storage.remove(addr) {
            Some(PeerConn::Connected {
                peer: Some(peer), ..
            }) => {
                // A surviving duplicate connection may own the UDP
                // endpoint by now; only unmap our own entry.
                if self.udp_index.get(&peer.udp_addr) == Some(addr) {
                    self.udp_index.remove(&peer.udp_addr);
                }
                self.upstream.event(Event::Disconnected(*addr, reason));
                Some((peer.name, peer.is_established()))
            }
            Some(PeerConn::Connected { peer: None, .. }) => {
                self.upstream.event(Event::Disconnected(*addr, reason));
                None
            }
            Some(PeerConn::Connecting { .. }) => {
                if let NetDisconnect::DialError(err) | NetDisconnect::ConnectionError(err) = reason
                {
                    self.upstream.event(Event::ConnectionFailed(*addr, err));
                }
                None
            }
            None => None,
        };
        result
    }

    /// Called on a timer tick: time out peers stuck in the handshake.
    pub fn received_wake(&mut self) {
        let local_time = self.clock.local_time();
        let mut timed_out = Vec::new();

        for (addr, state) in &self.peers_storage {
            match state {
                PeerConn::Connecting { time } => {
                    if local_time - *time >= CONNECTION_TIMEOUT {
                        timed_out.push((*addr, "connection"));
                    }
                }
                PeerConn::Connected {
                    conn, peer: None, ..
                } => {
                    if local_time - conn.since >= HANDSHAKE_TIMEOUT {
                        timed_out.push((*addr, "greeting"));
                    }
                }
                PeerConn::Connected {
                    peer: Some(peer), ..
                } => {
                    if let HandshakeState::Greeted { since } = peer.state {
                        if local_time - since >= HANDSHAKE_TIMEOUT {
                            timed_out.push((*addr, "establishment"));
                        }
                    }
                }
            }
        }

        for (addr, stage) in timed_out {
            self.upstream
                .disconnect(addr, DisconnectReason::PeerTimeout(stage));
        }
    }

    /// The `(initiator, acceptor)` pair identifying a connection
    /// between two peers, used to tie-break duplicates.
    fn name_pair(local: PeerName, remote: PeerName, link: Link) -> (PeerName, PeerName) {
        if link.is_outbound() {
            (local, remote)
        } else {
            (remote, local)
        }
    }
}

/// Lookups used by the rest of the state machine.
impl<U, C> PeerManager<U, C> {
    /// Whether an address is in use for connecting or connected.
    pub fn is_engaged(&self, addr: &SocketAddr) -> bool {
        self.peers_storage.contains_key(addr)
    }

    /// All addresses currently dialing or connected.
    pub fn engaged(&self) -> impl Iterator<Item = &SocketAddr> {
        self.peers_storage.keys()
    }

    /// Connections past the TCP stage.
    pub fn connected(&self) -> impl Iterator<Item = &Connection> {
        self.peers_storage.values().filter_map(|c| match c {
            PeerConn::Connected { conn, .. } => Some(conn),
            _ => None,
        })
    }

    /// Peers that have completed the greeting exchange.
    pub fn greeted(&self) -> impl Iterator<Item = (&PeerInfo, &Connection)> {
        self.peers_storage.values().filter_map(|c| match c {
            PeerConn::Connected {
                conn,
                peer: Some(peer),
                ..
            } => Some((peer, conn)),
            _ => None,
        })
    }

    /// Fully established peers.
    pub fn established(&self) -> impl Iterator<Item = (&PeerInfo, &Connection)> {
        self.greeted().filter(|(p, _)| p.is_established())
    }

    /// Session state for a connection, if encrypted.
    pub fn session_mut(&mut self, addr: &SocketAddr) -> Option<&mut Session> {
        match self.peers_storage.get_mut(addr) {
            Some(PeerConn::Connected {
                peer: Some(peer), ..
            }) => peer.session.as_mut(),
            _ => None,
        }
    }

    /// Whether a greeting is still outstanding on this connection.
    pub fn is_awaiting_greeting(&self, addr: &SocketAddr) -> bool {
        matches!(
            self.peers_storage.get(addr),
            Some(PeerConn::Connected { peer: None, .. })
        )
    }

    /// Map a datagram source address back to its TCP connection.
    pub fn lookup_udp(&self, udp_addr: &SocketAddr) -> Option<SocketAddr> {
        self.udp_index.get(udp_addr).copied()
    }

    /// The UDP endpoint of a connection's peer.
    pub fn udp_addr(&self, addr: &SocketAddr) -> Option<SocketAddr> {
        match self.peers_storage.get(addr) {
            Some(PeerConn::Connected {
                peer: Some(peer), ..
            }) => Some(peer.udp_addr),
            _ => None,
        }
    }

    /// The connection address for an established peer name.
    pub fn addr_of(&self, name: &PeerName) -> Option<SocketAddr> {
        self.greeted()
            .find(|(p, _)| p.name == *name)
            .map(|(_, c)| c.addr)
    }

    pub fn connecting(&self) -> impl Iterator<Item = &SocketAddr> {
        self.peers_storage
            .iter()
            .filter(|(_, p)| matches!(p, PeerConn::Connecting { .. }))
            .map(|(addr, _)| addr)
    }
}

/// Needed by tests and status reporting.
impl<U, C> PeerManager<U, C> {
    pub fn len(&self) -> usize {
        self.peers_storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers_storage.is_empty()
    }
}
