//! Protocol output capabilities.
//!
//! Each sub-protocol manager is given a copy of the [`Outbox`] with
//! specific capabilities (connecting, disconnecting, timers, wire
//! messages) to communicate with the network through the reactor.

use std::collections::VecDeque;
use std::net;
use std::sync::{Arc, Mutex};

use tracing::debug;

use weave_types::message::{ChannelId, Datagram, Greeting, Message};
use weave_types::PeerName;

use crate::fsm::event::Event;
use crate::fsm::handler::DisconnectReason;
use crate::net::LocalDuration;

/// Output of a state transition of the router state machine. The
/// handler translates these into encoded (and, with a session, sealed)
/// byte-level I/O for the reactor.
pub type Io = crate::net::Io<WireMsg, Event, DisconnectReason>;

/// A message queued for the wire, before encoding and sealing.
#[derive(Debug)]
pub enum WireMsg {
    /// The plaintext connection opener.
    Greeting(Greeting),
    /// A tagged protocol message on an established connection.
    Message(Message),
    /// A UDP datagram, optionally padded up to the given total size
    /// (heartbeats and PMTU probes travel at full PMTU width).
    Datagram(Datagram, Option<usize>),
}

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// The router wire protocol.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    // Handshake ///////////////////////////////////////////////////////////

    /// Send the connection greeting.
    fn greeting(&mut self, addr: net::SocketAddr, greeting: Greeting);

    /// Tell a peer its UDP heartbeats are reaching us.
    fn established(&mut self, addr: net::SocketAddr) -> &mut Self;

    // Liveness and PMTU ///////////////////////////////////////////////////

    /// Send a UDP heartbeat padded to the given size.
    fn heartbeat(&mut self, udp_addr: net::SocketAddr, pad_to: usize) -> &mut Self;

    /// Send a UDP PMTU probe padded to the given size.
    fn frag_test(&mut self, udp_addr: net::SocketAddr, pad_to: usize) -> &mut Self;

    /// Acknowledge a PMTU probe of the given size.
    fn pmtu_verified(&mut self, addr: net::SocketAddr, size: u16) -> &mut Self;

    // Gossip //////////////////////////////////////////////////////////////

    /// Send a full-state gossip exchange to a neighbour.
    fn gossip(&mut self, addr: net::SocketAddr, channel: ChannelId, payload: Vec<u8>);

    /// Relay a gossip broadcast along the spanning tree.
    fn gossip_broadcast(
        &mut self,
        addr: net::SocketAddr,
        channel: ChannelId,
        src: PeerName,
        payload: Vec<u8>,
    );

    /// Relay a gossip unicast towards its destination.
    fn gossip_unicast(
        &mut self,
        addr: net::SocketAddr,
        channel: ChannelId,
        src: PeerName,
        dst: PeerName,
        payload: Vec<u8>,
    );

    // Frames //////////////////////////////////////////////////////////////

    /// Send an encapsulated Ethernet frame over UDP.
    fn frame(
        &mut self,
        udp_addr: net::SocketAddr,
        src: PeerName,
        dst: PeerName,
        frame: Vec<u8>,
    ) -> &mut Self;
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.lock().unwrap().pop_front()
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound.lock().unwrap().push_back(output);
    }

    /// Push a message to the channel.
    pub fn message(&mut self, addr: net::SocketAddr, payload: Message) -> &Self {
        debug!(target: "mesh", "Sending {} to {}", payload.cmd(), addr);

        self.push(Io::Write(addr, WireMsg::Message(payload)));
        self
    }

    /// Push an event to the channel.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
        debug!(target: "mesh", "Disconnecting from {}: {}", addr, reason);

        self.push(Io::Disconnect(addr, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration) {
        self.push(Io::Connect(addr));
        self.push(Io::SetTimer(timeout));
    }
}

impl<E: Into<Event> + std::fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "mesh", "{}", &event);
        self.event(event.into());
    }

    fn greeting(&mut self, addr: net::SocketAddr, greeting: Greeting) {
        debug!(target: "mesh", "Sending greeting to {}", addr);

        self.push(Io::Write(addr, WireMsg::Greeting(greeting)));
    }

    fn established(&mut self, addr: net::SocketAddr) -> &mut Self {
        self.message(addr, Message::ConnectionEstablished);
        self
    }

    fn heartbeat(&mut self, udp_addr: net::SocketAddr, pad_to: usize) -> &mut Self {
        self.push(Io::SendUdp(
            udp_addr,
            WireMsg::Datagram(Datagram::Heartbeat, Some(pad_to)),
        ));
        self
    }

    fn frag_test(&mut self, udp_addr: net::SocketAddr, pad_to: usize) -> &mut Self {
        self.push(Io::SendUdp(
            udp_addr,
            WireMsg::Datagram(Datagram::FragmentationTest, Some(pad_to)),
        ));
        self
    }

    fn pmtu_verified(&mut self, addr: net::SocketAddr, size: u16) -> &mut Self {
        self.message(addr, Message::PmtuVerified(size));
        self
    }

    fn gossip(&mut self, addr: net::SocketAddr, channel: ChannelId, payload: Vec<u8>) {
        self.message(addr, Message::Gossip { channel, payload });
    }

    fn gossip_broadcast(
        &mut self,
        addr: net::SocketAddr,
        channel: ChannelId,
        src: PeerName,
        payload: Vec<u8>,
    ) {
        self.message(
            addr,
            Message::GossipBroadcast {
                channel,
                src,
                payload,
            },
        );
    }

    fn gossip_unicast(
        &mut self,
        addr: net::SocketAddr,
        channel: ChannelId,
        src: PeerName,
        dst: PeerName,
        payload: Vec<u8>,
    ) {
        self.message(
            addr,
            Message::GossipUnicast {
                channel,
                src,
                dst,
                payload,
            },
        );
    }

    fn frame(
        &mut self,
        udp_addr: net::SocketAddr,
        src: PeerName,
        dst: PeerName,
        frame: Vec<u8>,
    ) -> &mut Self {
        self.push(Io::SendUdp(
            udp_addr,
            WireMsg::Datagram(Datagram::Frame { src, dst, frame }, None),
        ));
        self
    }
}
