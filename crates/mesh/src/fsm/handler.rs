//! The router state machine: composes the sub-protocol managers and
//! translates between wire bytes and protocol messages.

use std::collections::{BTreeMap, HashSet};
use std::{fmt, net, net::SocketAddr};

use flume as chan;
use tracing::{debug, trace};

use weave_types::message::{ChannelId, Datagram, Greeting, Message};
use weave_types::wire::{self, Decodable};
use weave_types::{PeerName, PeerUid};

use crate::crypto;
use crate::fsm::connmgr::{ConnectionMaker, Target, TargetSource, TargetState};
use crate::fsm::event::Event;
use crate::fsm::fwdmgr::{Counters, Endpoint, Forwarder, Neighbors};
use crate::fsm::gossipmgr::{GossipEvent, GossipManager, GossipNeighbors, GOSSIP_INTERVAL};
use crate::fsm::heartbeat::HeartbeatManager;
use crate::fsm::output::{Disconnect as _, Io as FsmIo, Outbox, SetTimer, WireMsg};
use crate::fsm::peermgr::{self, PeerManager};
use crate::fsm::topology::{self, Routes, Topology};
use crate::net::time::{Clock, RefClock};
use crate::net::{Disconnect, Io, Link, LocalTime};

pub type PeerId = net::SocketAddr;

/// Name of the built-in topology gossip channel.
pub const TOPOLOGY_CHANNEL: &str = "topology";

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Protocol tag or version mismatch in the greeting.
    ProtocolMismatch,
    /// The greeting echoed our own name back.
    SelfConnection,
    /// We already hold a connection to this peer.
    DuplicateConnection,
    /// One side expects an encrypted session and the other does not.
    EncryptionMismatch,
    /// Connection limit reached.
    ConnectionLimit,
    /// Peer timed out during a handshake stage.
    PeerTimeout(&'static str),
    /// Six consecutive heartbeats were lost.
    HeartbeatTimeout,
    /// Error trying to decode an incoming message.
    DecodeError,
    /// A sealed message failed authentication.
    SessionError,
    /// Peer sent data violating the protocol.
    ProtocolViolation(&'static str),
    /// Peer was disconnected by an external command.
    Command,
}

impl DisconnectReason {
    /// Whether the reason is transient, ie. may no longer apply after
    /// some time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLimit | Self::PeerTimeout(_) | Self::HeartbeatTimeout
        )
    }
}

impl From<DisconnectReason> for Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolMismatch => write!(f, "protocol tag or version mismatch"),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::DuplicateConnection => write!(f, "duplicate connection to the same peer"),
            Self::EncryptionMismatch => write!(f, "encryption expectation mismatch"),
            Self::ConnectionLimit => write!(f, "connection limit reached"),
            Self::PeerTimeout(stage) => write!(f, "peer timed out: {:?}", stage),
            Self::HeartbeatTimeout => write!(f, "heartbeats lost"),
            Self::DecodeError => write!(f, "message decode error"),
            Self::SessionError => write!(f, "session authentication failure"),
            Self::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            Self::Command => write!(f, "received external command"),
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Our stable name.
    pub name: PeerName,
    /// Our nickname, shown in status output.
    pub nick_name: String,
    /// Our incarnation id, regenerated each start.
    pub uid: PeerUid,
    /// The router port; UDP datagrams are received on it too.
    pub port: u16,
    /// Cluster password; enables session encryption.
    pub password: Option<String>,
    /// Initial connection targets.
    pub peers: Vec<SocketAddr>,
    /// Cap on concurrent connections.
    pub conn_limit: usize,
}

/// A command or request that can be sent to the router.
pub enum Command {
    /// Add a connection target.
    Connect(SocketAddr),
    /// Remove a connection target.
    Forget(SocketAddr),
    /// Request a status report.
    Status(chan::Sender<StatusReport>),
    /// Request the current peer list.
    Peers(chan::Sender<Vec<PeerView>>),
    /// Register an external gossip channel.
    RegisterChannel(String, chan::Sender<GossipEvent>),
    /// Broadcast on a gossip channel.
    Broadcast(String, Vec<u8>),
    /// Unicast to a specific peer on a gossip channel.
    Unicast(String, PeerName, Vec<u8>),
    /// Full-state exchange with all neighbours on a gossip channel.
    Gossip(String, Vec<u8>),
    /// An Ethernet frame captured on the local device.
    Capture(Vec<u8>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(addr) => write!(f, "Connect({})", addr),
            Self::Forget(addr) => write!(f, "Forget({})", addr),
            Self::Status(_) => write!(f, "Status"),
            Self::Peers(_) => write!(f, "Peers"),
            Self::RegisterChannel(name, _) => write!(f, "RegisterChannel({})", name),
            Self::Broadcast(name, payload) => {
                write!(f, "Broadcast({}, {} bytes)", name, payload.len())
            }
            Self::Unicast(name, dst, payload) => {
                write!(f, "Unicast({}, {}, {} bytes)", name, dst, payload.len())
            }
            Self::Gossip(name, payload) => write!(f, "Gossip({}, {} bytes)", name, payload.len()),
            Self::Capture(frame) => write!(f, "Capture({} bytes)", frame.len()),
        }
    }
}

/// A peer as reported to status consumers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerView {
    pub name: PeerName,
    pub nick_name: String,
    pub uid: String,
    pub version: u64,
    pub connections: Vec<EdgeView>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EdgeView {
    pub peer: PeerName,
    pub established: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionView {
    pub addr: String,
    pub peer: Option<PeerName>,
    pub established: bool,
    pub outbound: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TargetView {
    pub addr: String,
    pub state: TargetState,
    pub attempts: u32,
    pub source: TargetSource,
}

/// Snapshot of the router state, served over the control API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub version: String,
    pub name: PeerName,
    pub nick_name: String,
    pub uid: String,
    pub encryption: bool,
    pub peers: Vec<PeerView>,
    pub routes: BTreeMap<PeerName, PeerName>,
    pub connections: Vec<ConnectionView>,
    pub targets: Vec<TargetView>,
    pub counters: Counters,
    pub mac_cache_entries: usize,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "weave router {}", self.version)?;
        writeln!(f, "our name is {} ({})", self.name, self.nick_name)?;
        writeln!(
            f,
            "encryption {}",
            if self.encryption { "on" } else { "off" }
        )?;
        writeln!(f)?;
        writeln!(f, "peers:")?;
        for peer in &self.peers {
            writeln!(
                f,
                "  {} ({}) v{}",
                peer.name, peer.nick_name, peer.version
            )?;
            for edge in &peer.connections {
                writeln!(
                    f,
                    "    -> {}{}",
                    edge.peer,
                    if edge.established { "" } else { " (pending)" }
                )?;
            }
        }
        writeln!(f)?;
        writeln!(f, "routes:")?;
        for (dst, hop) in &self.routes {
            writeln!(f, "  {} via {}", dst, hop)?;
        }
        writeln!(f)?;
        writeln!(f, "targets:")?;
        for target in &self.targets {
            writeln!(
                f,
                "  {} {:?} attempts={} ({})",
                target.addr, target.state, target.attempts, target.source
            )?;
        }
        Ok(())
    }
}

/// An instance of the router protocol.
pub struct StateMachine {
    /// Router configuration.
    pub config: Config,
    /// Everything we know about the mesh.
    topology: Topology,
    /// Routing tables derived from the topology.
    routes: Routes,
    /// Connection lifecycle.
    pub peermgr: PeerManager<Outbox, RefClock>,
    /// Dial retry schedule.
    connmgr: ConnectionMaker<Outbox, RefClock>,
    /// Liveness probes and PMTU.
    hbmgr: HeartbeatManager<Outbox, RefClock>,
    /// Frame forwarding.
    fwdmgr: Forwarder<Outbox, RefClock>,
    /// Channelized gossip dissemination.
    gossipmgr: GossipManager<Outbox>,
    topology_channel: ChannelId,
    last_gossip: LocalTime,
    /// Outbound I/O, shared with the managers.
    outbox: Outbox,
    pub clock: RefClock,
}

impl StateMachine {
    /// Construct a new protocol instance.
    pub fn new(
        config: Config,
        rng: fastrand::Rng,
        clock: RefClock,
        inject: chan::Sender<Vec<u8>>,
        channels: Vec<(String, chan::Sender<GossipEvent>)>,
    ) -> Self {
        let outbox = Outbox::new();

        let peermgr = PeerManager::new(
            peermgr::Config {
                name: config.name,
                nick_name: config.nick_name.clone(),
                uid: config.uid,
                udp_port: config.port,
                password: config.password.clone(),
                conn_limit: config.conn_limit,
            },
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let connmgr = ConnectionMaker::new(
            config.peers.clone(),
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let hbmgr = HeartbeatManager::new(outbox.clone(), clock.clone());
        let fwdmgr = Forwarder::new(
            config.name,
            inject,
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let mut gossipmgr = GossipManager::new(config.name, outbox.clone());
        for (name, delivery) in channels {
            gossipmgr.register(&name, delivery);
        }
        let topology_channel = ChannelId::of(TOPOLOGY_CHANNEL);

        let topology = Topology::new(config.name, config.nick_name.clone(), config.uid);
        let routes = Routes::compute(&topology);

        Self {
            config,
            topology,
            routes,
            peermgr,
            connmgr,
            hbmgr,
            fwdmgr,
            gossipmgr,
            topology_channel,
            last_gossip: LocalTime::default(),
            outbox,
            clock,
        }
    }

    /// Established peers with their UDP endpoints and datagram
    /// budgets.
    fn frame_neighbors(&self) -> Neighbors {
        self.peermgr
            .established()
            .map(|(peer, conn)| {
                let pmtu = self.hbmgr.pmtu(&conn.addr);
                let overhead = if peer.session.is_some() {
                    crypto::DATAGRAM_OVERHEAD
                } else {
                    0
                };
                (
                    peer.name,
                    Endpoint {
                        udp_addr: peer.udp_addr,
                        max_payload: pmtu.saturating_sub(overhead),
                    },
                )
            })
            .collect()
    }

    /// Established peers with their connection addresses, for gossip.
    fn gossip_neighbors(&self) -> GossipNeighbors {
        self.peermgr
            .established()
            .map(|(peer, conn)| (peer.name, conn.addr))
            .collect()
    }

    /// Gossip our own (changed) record into the mesh.
    fn gossip_self(&mut self) {
        let local = self.config.name;
        let channel = self.topology_channel;
        let payload = self.topology.encode_peers([&local]);
        let neighbors = self.gossip_neighbors();
        self.gossipmgr
            .broadcast(&channel, payload, &self.routes, &neighbors);
    }

    /// Process a received topology gossip payload.
    fn topology_received(&mut self, addr: SocketAddr, payload: &[u8]) {
        let updates = match Topology::decode_update(payload) {
            Ok(updates) => updates,
            Err(err) => {
                debug!(target: "mesh", "{}: Bad topology update: {}", addr, err);
                self.outbox.disconnect(addr, DisconnectReason::DecodeError);
                return;
            }
        };

        match self.topology.apply_update(updates) {
            Ok(changed) if !changed.is_empty() => {
                self.routes = Routes::compute(&self.topology);

                // Advertised addresses of newly learned peers become
                // connection hints.
                let hints: Vec<SocketAddr> = changed
                    .iter()
                    .filter_map(|name| self.topology.get(name))
                    .flat_map(|peer| peer.connections.values())
                    .filter_map(|summary| summary.addr)
                    .collect();
                self.connmgr.add_hints(hints);

                // Relay the news along the broadcast tree.
                let channel = self.topology_channel;
                let local = self.config.name;
                let payload = self.topology.encode_peers(changed.iter());
                let neighbors = self.gossip_neighbors();
                self.gossipmgr
                    .relay_broadcast(&channel, local, payload, &self.routes, &neighbors);
            }
            Ok(_) => {}
            Err(topology::Error::Conflict(name)) => {
                debug!(target: "mesh", "{}: Conflicting update for {}", addr, name);
                self.outbox
                    .disconnect(addr, DisconnectReason::ProtocolViolation("topology conflict"));
            }
            Err(topology::Error::Decode(_)) => {
                self.outbox.disconnect(addr, DisconnectReason::DecodeError);
            }
        }
    }

    /// Handle the remote greeting on a fresh connection.
    fn greeting_received(&mut self, addr: SocketAddr, greeting: Greeting) {
        match self.peermgr.received_greeting(&addr, greeting) {
            Ok(Some(negotiated)) => {
                if self.config.password.is_some() {
                    // Key confirmation: the first sealed message fails
                    // authentication right away when the passwords
                    // differ, instead of letting the handshake idle
                    // out.
                    self.outbox.message(addr, Message::Heartbeat);
                }
                self.hbmgr.peer_greeted(addr, negotiated.udp_addr);
                self.topology
                    .record_connection(negotiated.name, negotiated.advertised_addr, false);
                self.gossip_self();
            }
            Ok(None) => {}
            Err(reason) => {
                if matches!(reason, DisconnectReason::SelfConnection) {
                    // Dialing this address reaches ourselves; never
                    // try it again.
                    self.connmgr.poison(addr);
                }
                self.outbox.disconnect(addr, reason);
            }
        }
    }

    /// Process a decoded protocol message.
    fn message_dispatched(&mut self, addr: SocketAddr, message: Message) {
        match message {
            Message::ConnectionEstablished => {
                if let Some(name) = self.peermgr.connection_established(&addr) {
                    let advertised = self
                        .peermgr
                        .greeted()
                        .find(|(_, c)| c.addr == addr)
                        .and_then(|(_, c)| c.link.is_outbound().then_some(c.addr));

                    self.topology.record_connection(name, advertised, true);
                    self.routes = Routes::compute(&self.topology);
                    self.connmgr.connection_established(&addr);
                    self.gossip_self();

                    // Bring the new peer up to date immediately rather
                    // than waiting for the periodic round.
                    let payload = self.topology.encode_all();
                    let channel = self.topology_channel;
                    self.outbox.message(addr, Message::Gossip { channel, payload });
                }
            }
            Message::PmtuVerified(size) => self.hbmgr.pmtu_verified(&addr, size),
            Message::Heartbeat | Message::FragmentationTest => {
                // These travel over UDP; the TCP forms carry no
                // information.
            }
            Message::Gossip { channel, payload } => {
                if channel == self.topology_channel {
                    self.topology_received(addr, &payload);
                } else {
                    let from = self.peer_name_of(&addr);
                    if let Some(from) = from {
                        self.gossipmgr.received_gossip(&channel, from, payload);
                    }
                }
            }
            Message::GossipBroadcast {
                channel,
                src,
                payload,
            } => {
                if channel == self.topology_channel {
                    self.topology_received(addr, &payload);
                    // Relaying happens inside `topology_received` when
                    // the update contained news; stale broadcasts stop
                    // here.
                } else {
                    let neighbors = self.gossip_neighbors();
                    self.gossipmgr.received_broadcast(
                        &channel,
                        src,
                        payload,
                        &self.routes,
                        &neighbors,
                    );
                }
            }
            Message::GossipUnicast {
                channel,
                src,
                dst,
                payload,
            } => {
                let neighbors = self.gossip_neighbors();
                self.gossipmgr
                    .received_unicast(&channel, src, dst, payload, &self.routes, &neighbors);
            }
        }
    }

    fn peer_name_of(&self, addr: &SocketAddr) -> Option<PeerName> {
        self.peermgr
            .greeted()
            .find(|(_, c)| c.addr == *addr)
            .map(|(p, _)| p.name)
    }

    /// Process a user command.
    pub async fn command(&mut self, cmd: Command) {
        debug!(target: "mesh", "Received command: {:?}", cmd);

        match cmd {
            Command::Connect(addr) => {
                self.connmgr.add_target(addr, TargetSource::Api);
            }
            Command::Forget(addr) => {
                self.connmgr.forget(&addr);
            }
            Command::Status(reply) => {
                let report = self.status();
                reply.send_async(report).await.ok();
            }
            Command::Peers(reply) => {
                let peers = self.peer_views();
                reply.send_async(peers).await.ok();
            }
            Command::RegisterChannel(name, delivery) => {
                self.gossipmgr.register(&name, delivery);
            }
            Command::Broadcast(name, payload) => {
                let id = ChannelId::of(&name);
                let neighbors = self.gossip_neighbors();
                self.gossipmgr
                    .broadcast(&id, payload, &self.routes, &neighbors);
            }
            Command::Unicast(name, dst, payload) => {
                let id = ChannelId::of(&name);
                let local = self.config.name;
                let neighbors = self.gossip_neighbors();
                self.gossipmgr
                    .forward_unicast(&id, local, dst, payload, &self.routes, &neighbors);
            }
            Command::Gossip(name, payload) => {
                let id = ChannelId::of(&name);
                let neighbors = self.gossip_neighbors();
                self.gossipmgr.gossip_neighbors(&id, payload, &neighbors);
            }
            Command::Capture(frame) => {
                let neighbors = self.frame_neighbors();
                self.fwdmgr.frame_captured(frame, &self.routes, &neighbors);
            }
        }
    }

    fn peer_views(&self) -> Vec<PeerView> {
        self.topology
            .peers()
            .map(|peer| PeerView {
                name: peer.name,
                nick_name: peer.nick_name.clone(),
                uid: peer.uid.to_string(),
                version: peer.version,
                connections: peer
                    .connections
                    .iter()
                    .map(|(name, summary)| EdgeView {
                        peer: *name,
                        established: summary.established,
                    })
                    .collect(),
            })
            .collect()
    }

    /// Build a status snapshot.
    pub fn status(&self) -> StatusReport {
        StatusReport {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            name: self.config.name,
            nick_name: self.config.nick_name.clone(),
            uid: self.config.uid.to_string(),
            encryption: self.config.password.is_some(),
            peers: self.peer_views(),
            routes: self.routes.unicast().clone(),
            connections: self
                .peermgr
                .connected()
                .map(|conn| ConnectionView {
                    addr: conn.addr.to_string(),
                    peer: self.peer_name_of(&conn.addr),
                    established: self
                        .peermgr
                        .established()
                        .any(|(_, c)| c.addr == conn.addr),
                    outbound: conn.link.is_outbound(),
                })
                .collect(),
            targets: self
                .connmgr
                .targets()
                .map(|(addr, target): (&SocketAddr, &Target)| TargetView {
                    addr: addr.to_string(),
                    state: target.state,
                    attempts: target.attempts,
                    source: target.source,
                })
                .collect(),
            counters: self.fwdmgr.counters().clone(),
            mac_cache_entries: self.fwdmgr.cache_len(),
        }
    }

    /// Called once by the reactor before network activity starts.
    pub fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.last_gossip = time;
        self.outbox.event(Event::Initializing);
        self.connmgr.initialize();
        self.outbox.set_timer(GOSSIP_INTERVAL);
        self.outbox.event(Event::Ready { time });
    }

    /// Raw frame payload received on a connection (already
    /// length-deframed by the service).
    pub fn frame_payload_received(&mut self, addr: SocketAddr, payload: Vec<u8>) {
        if self.peermgr.is_awaiting_greeting(&addr) {
            match Greeting::decode(&mut payload.as_slice()) {
                Ok(greeting) => self.greeting_received(addr, greeting),
                Err(wire::Error::ProtocolMismatch) => {
                    self.outbox
                        .disconnect(addr, DisconnectReason::ProtocolMismatch);
                }
                Err(_) => {
                    self.outbox.disconnect(addr, DisconnectReason::DecodeError);
                }
            }
            return;
        }

        let plain = match self.peermgr.session_mut(&addr) {
            Some(session) => match session.open_message(&payload) {
                Ok(plain) => plain,
                Err(err) => {
                    debug!(target: "mesh", "{}: {}", addr, err);
                    self.outbox.disconnect(addr, DisconnectReason::SessionError);
                    return;
                }
            },
            None => payload,
        };

        match Message::decode(&mut plain.as_slice()) {
            Ok(message) => {
                trace!(target: "mesh", "Received {} from {}", message.cmd(), addr);
                self.message_dispatched(addr, message);
            }
            Err(err) => {
                debug!(target: "mesh", "{}: Bad message: {}", addr, err);
                self.outbox.disconnect(addr, DisconnectReason::DecodeError);
            }
        }
    }

    /// A datagram arrived on the UDP socket.
    pub fn datagram_received(&mut self, from: SocketAddr, bytes: &[u8]) {
        let Some(tcp_addr) = self.peermgr.lookup_udp(&from) else {
            trace!(target: "mesh", "Datagram from unknown endpoint {}, dropping", from);
            return;
        };

        let wire_size = bytes.len();
        let plain = match self.peermgr.session_mut(&tcp_addr) {
            Some(session) => match session.open_datagram(bytes) {
                Ok(plain) => plain,
                Err(err) => {
                    trace!(target: "mesh", "{}: Dropping datagram: {}", from, err);
                    return;
                }
            },
            None => bytes.to_vec(),
        };

        match Datagram::from_bytes(&plain) {
            Ok(Datagram::Heartbeat) => {
                if self.hbmgr.heartbeat_received(&tcp_addr) {
                    // First heartbeat from this peer: its UDP path
                    // works, tell it so over TCP.
                    self.outbox.message(tcp_addr, Message::ConnectionEstablished);
                }
            }
            Ok(Datagram::FragmentationTest) => {
                if let Some(size) = self.hbmgr.frag_test_received(&tcp_addr, wire_size) {
                    self.outbox.message(tcp_addr, Message::PmtuVerified(size));
                }
            }
            Ok(Datagram::Frame { src, dst, frame }) => {
                let neighbors = self.frame_neighbors();
                self.fwdmgr
                    .frame_received(src, dst, frame, &self.routes, &neighbors);
            }
            Err(err) => {
                trace!(target: "mesh", "{}: Bad datagram: {}", from, err);
            }
        }
    }

    /// A datagram could not be sent.
    pub fn datagram_send_failed(&mut self, addr: SocketAddr, err: &std::io::Error) {
        if err.raw_os_error() == Some(libc::EMSGSIZE) {
            self.hbmgr.send_failed_oversize(&addr);
        }
    }

    pub fn attempted(&mut self, addr: &SocketAddr) {
        self.peermgr.peer_attempted(addr);
    }

    pub fn connected(&mut self, addr: SocketAddr, local_addr: &SocketAddr, link: Link) {
        self.peermgr.peer_connected(addr, *local_addr, link);
    }

    pub fn disconnected(&mut self, addr: &SocketAddr, reason: Disconnect<DisconnectReason>) {
        self.hbmgr.peer_disconnected(addr);

        if let Some((name, _established)) = self.peermgr.peer_disconnected(addr, reason) {
            // A duplicate connection to the same peer may survive;
            // only drop the edge when the last one is gone.
            let survives = self.peermgr.greeted().any(|(p, _)| p.name == name);
            if !survives {
                self.topology.remove_connection(name);
                if self.topology.get(&name).is_none() {
                    // The peer fell out of the mesh entirely; traffic
                    // for its MACs must flood again.
                    self.fwdmgr.peer_removed(name);
                }
                self.routes = Routes::compute(&self.topology);
                self.gossip_self();
            }
        }

        if self.connmgr.is_target(addr) {
            self.connmgr.attempt_failed(addr);
        }
    }

    pub fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
    }

    pub fn timer_expired(&mut self) {
        trace!(target: "mesh", "Received wake");

        self.peermgr.received_wake();
        self.hbmgr.received_wake();
        self.fwdmgr.received_wake();

        let engaged: HashSet<SocketAddr> = self.peermgr.engaged().copied().collect();
        let at_capacity = self.peermgr.greeted().count() >= self.config.conn_limit;
        self.connmgr.received_wake(&engaged, at_capacity);

        // Periodic anti-entropy: our full topology to every
        // neighbour.
        let now = self.clock.local_time();
        if now - self.last_gossip >= GOSSIP_INTERVAL {
            self.last_gossip = now;
            let channel = self.topology_channel;
            let payload = self.topology.encode_all();
            let neighbors = self.gossip_neighbors();
            for addr in neighbors.values() {
                self.outbox.message(
                    *addr,
                    Message::Gossip {
                        channel,
                        payload: payload.clone(),
                    },
                );
            }
            self.outbox.set_timer(GOSSIP_INTERVAL);
        }
    }

    /// Disconnect a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.outbox.disconnect(addr, reason);
    }

    /// The topology, for tests and the client.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }
}

/// The handler drains its outbox as encoded, sealed byte-level I/O.
impl Iterator for StateMachine {
    type Item = Io<Vec<u8>, Event, DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let io = self.outbox.next()?;
            match io {
                FsmIo::Write(addr, WireMsg::Greeting(greeting)) => {
                    let body = wire::encode_to_vec(&greeting)
                        .expect("writing to an in-memory buffer doesn't fail");
                    let framed = wire::frame(&body).expect("a greeting fits a frame");
                    return Some(Io::Write(addr, framed));
                }
                FsmIo::Write(addr, WireMsg::Message(message)) => {
                    let body = wire::encode_to_vec(&message)
                        .expect("writing to an in-memory buffer doesn't fail");
                    let body = match self.peermgr.session_mut(&addr) {
                        Some(session) => session.seal_message(&body),
                        None => body,
                    };
                    match wire::frame(&body) {
                        Ok(framed) => return Some(Io::Write(addr, framed)),
                        Err(err) => {
                            debug!(target: "mesh", "{}: Dropping oversized message: {}", addr, err);
                            continue;
                        }
                    }
                }
                FsmIo::SendUdp(udp_addr, WireMsg::Datagram(datagram, pad_to)) => {
                    let session = self
                        .peermgr
                        .lookup_udp(&udp_addr)
                        .and_then(|tcp| self.peermgr.session_mut(&tcp).map(|_| tcp));

                    let overhead = if session.is_some() {
                        crypto::DATAGRAM_OVERHEAD
                    } else {
                        0
                    };
                    let plain = match pad_to {
                        Some(size) => datagram.to_padded_bytes(size.saturating_sub(overhead)),
                        None => datagram.to_bytes(),
                    };

                    let bytes = match session
                        .and_then(|tcp| self.peermgr.session_mut(&tcp))
                    {
                        Some(session) => session.seal_datagram(&plain),
                        None => plain,
                    };
                    return Some(Io::SendUdp(udp_addr, bytes));
                }
                FsmIo::Write(_, WireMsg::Datagram(..)) | FsmIo::SendUdp(_, WireMsg::Greeting(_))
                | FsmIo::SendUdp(_, WireMsg::Message(_)) => {
                    // The outbox never produces these combinations.
                    continue;
                }
                FsmIo::Connect(addr) => return Some(Io::Connect(addr)),
                FsmIo::Disconnect(addr, reason) => return Some(Io::Disconnect(addr, reason)),
                FsmIo::SetTimer(duration) => return Some(Io::SetTimer(duration)),
                FsmIo::Event(event) => return Some(Io::Event(event)),
            }
        }
    }
}

