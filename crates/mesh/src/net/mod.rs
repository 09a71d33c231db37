//! Networking core types: the reactor/state-machine boundary.

use std::{borrow::Cow, fmt, io, net, sync::Arc};

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

pub use reactor::{ReactorTcp, Waker};
pub use time::{Clock, LocalDuration, LocalTime};

pub mod error;
pub mod reactor;
mod socket;
pub mod time;

/// What a readiness event is about.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Source {
    /// A TCP peer connection.
    Peer(net::SocketAddr),
    /// The TCP listener.
    Listener,
    /// The UDP socket carrying frames and heartbeats.
    Udp,
    /// The user-thread waker.
    Waker,
}

/// Link direction of the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Inbound connection.
    Inbound,
    /// Outbound connection.
    Outbound,
}

impl Link {
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Output of a state transition of the state machine.
#[derive(Debug)]
pub enum Io<M, E, D> {
    /// There is a message ready to be sent to a peer.
    Write(net::SocketAddr, M),
    /// A datagram ready to be sent to a peer's UDP endpoint.
    SendUdp(net::SocketAddr, M),
    /// Connect to a peer.
    Connect(net::SocketAddr),
    /// Disconnect from a peer.
    Disconnect(net::SocketAddr, D),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(E),
}

/// Disconnection event which includes the reason.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// Error while dialing the remote. Occurs before a connection is
    /// even established.
    DialError(Arc<io::Error>),
    /// Error with an underlying established connection.
    ConnectionError(Arc<io::Error>),
    /// Peer was disconnected by the state machine.
    StateMachine(T),
}

impl<T> Disconnect<T> {
    pub fn is_dial_err(&self) -> bool {
        matches!(self, Self::DialError(_))
    }
}

impl<T: fmt::Display> fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialError(err) => write!(f, "{}", err),
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::StateMachine(reason) => write!(f, "{}", reason),
        }
    }
}

/// A service state machine to implement the router's logic.
///
/// The reactor feeds network activity into the machine; the machine
/// emits [`Io`] instructions back through its [`Iterator`] impl.
#[async_trait]
pub trait StateMachine:
    Iterator<Item = Io<Vec<u8>, Self::Event, Self::DisconnectReason>>
{
    /// Events emitted by the state machine.
    type Event: fmt::Debug + Send;
    /// Reason a peer was disconnected by the machine itself.
    type DisconnectReason: fmt::Debug
        + fmt::Display
        + Into<Disconnect<Self::DisconnectReason>>;

    /// Called once before any event is delivered.
    async fn initialize(&mut self, _time: LocalTime) {}
    /// Bytes were received on a peer's TCP stream.
    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>);
    /// A datagram was received on the UDP socket.
    async fn datagram_received(&mut self, from: net::SocketAddr, bytes: &[u8]);
    /// A datagram could not be sent. `EMSGSIZE` here drives PMTU
    /// discovery downwards.
    fn datagram_send_failed(&mut self, addr: net::SocketAddr, err: &io::Error);
    /// An outgoing connection attempt is underway.
    fn attempted(&mut self, addr: &net::SocketAddr);
    /// A new connection with a peer was set up.
    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link);
    /// A peer connection went away, either by instruction
    /// ([`Io::Disconnect`]) or because of a network event.
    async fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    );
    /// Called every reactor loop to update the machine's clock.
    fn tick(&mut self, local_time: LocalTime);
    /// A timer set with [`Io::SetTimer`] has expired.
    async fn timer_expired(&mut self);
}

/// A network service drivable by the reactor: a state machine plus a
/// command inbox fed from user threads.
#[async_trait]
pub trait Service: StateMachine {
    type Command: Send + Sync;

    /// An external command has been received.
    async fn command_received(&mut self, cmd: Self::Command);
}

/// Used to wake the event loop when a command is ready.
pub trait NetWaker: Send + Sync + Clone {
    fn wake(&self) -> io::Result<()>;
}

/// A reactor that can drive the mesh service.
#[async_trait]
pub trait NetReactor {
    type Waker: NetWaker;

    /// Create a new reactor with a channel to publish the bound
    /// listen address on.
    fn new(listening: chan::Sender<net::SocketAddr>) -> Result<Self, io::Error>
    where
        Self: Sized;

    /// Run the given service with the reactor. `listen_addr` is bound
    /// for both TCP (control) and UDP (frames, heartbeats).
    async fn run<S>(
        &mut self,
        listen_addr: &net::SocketAddr,
        service: S,
        commands: chan::Receiver<S::Command>,
        cancellation: CancellationToken,
    ) -> Result<(), error::Error>
    where
        S: Service + Send + Sync,
        S::DisconnectReason: Send + Sync;

    /// Return a new waker for the event loop.
    fn waker(&self) -> Self::Waker;
}
