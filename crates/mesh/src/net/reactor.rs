//! Poll-based reactor. A single-threaded `poll` loop drives the state
//! machine with TCP streams, the UDP socket and timers.

use std::{
    collections::{HashMap, HashSet},
    io,
    net,
    net::SocketAddr,
    sync::Arc,
    time,
    time::SystemTime,
};

use async_trait::async_trait;
use flume as chan;
use flume::Receiver;
use popol::Event;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::net::socket::Socket;
use crate::net::time::TimeoutManager;
use crate::net::{
    error::Error, Disconnect, Io, Link, LocalDuration, LocalTime, NetReactor, NetWaker, Service,
    Source,
};

/// Maximum time to wait when reading from a socket.
const READ_TIMEOUT: time::Duration = time::Duration::from_secs(6);
/// Maximum time to wait when writing to a socket.
const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(3);
/// Maximum amount of time to wait for i/o.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024 * 192;
/// UDP receive buffer size. Datagrams are never larger than the PMTU,
/// which is well below this.
const UDP_BUFFER_SIZE: usize = 1024 * 64;
/// Two timers closer together than this are coalesced. Heartbeats
/// tick at 500ms, so the threshold must sit below that.
const TIMEOUT_THRESHOLD: LocalDuration = LocalDuration::from_millis(250);

pub type ReactorTcp = Reactor;

#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new(sources: &mut popol::Sources<Source>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);

        Ok(Self(waker))
    }
}

impl NetWaker for Waker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// A single-threaded non-blocking reactor.
pub struct Reactor {
    peers: HashMap<SocketAddr, Socket<net::TcpStream>>,
    connecting: HashSet<SocketAddr>,
    sources: popol::Sources<Source>,
    waker: Waker,
    timeouts: TimeoutManager<()>,
    listening: chan::Sender<net::SocketAddr>,
    udp: Option<net::UdpSocket>,
}

impl Reactor {
    /// Register a peer with the reactor.
    fn register_peer(&mut self, addr: SocketAddr, stream: net::TcpStream, link: Link) {
        self.sources
            .register(Source::Peer(addr), &stream, popol::interest::ALL);
        self.peers.insert(addr, Socket::from(stream, addr, link));
    }

    /// Unregister a peer from the reactor.
    async fn unregister_peer<S>(
        &mut self,
        addr: SocketAddr,
        reason: Disconnect<S::DisconnectReason>,
        service: &mut S,
    ) where
        S: Service,
    {
        self.connecting.remove(&addr);
        self.peers.remove(&addr);
        self.sources.unregister(&Source::Peer(addr));

        service.disconnected(&addr, reason).await;
    }
}

#[async_trait]
impl NetReactor for Reactor {
    type Waker = Waker;

    fn new(listening: chan::Sender<net::SocketAddr>) -> Result<Self, io::Error> {
        let peers = HashMap::new();

        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;
        let timeouts = TimeoutManager::new(TIMEOUT_THRESHOLD);
        let connecting = HashSet::new();

        Ok(Self {
            peers,
            connecting,
            sources,
            waker,
            timeouts,
            listening,
            udp: None,
        })
    }

    async fn run<S>(
        &mut self,
        listen_addr: &SocketAddr,
        mut service: S,
        commands: Receiver<S::Command>,
        cancellation: CancellationToken,
    ) -> Result<(), Error>
    where
        S: Service + Send + Sync,
        S::DisconnectReason: Send + Sync,
    {
        let listener = self.listen(listen_addr).await?;

        let local_time = SystemTime::now().into();
        service.initialize(local_time).await;

        self.process(&mut service, local_time).await;

        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut events = Vec::with_capacity(32);
        // Timeouts populated by `TimeoutManager::wake`.
        let mut timeouts: Vec<()> = Vec::with_capacity(32);

        loop {
            select! {
                _ = cancellation.cancelled() => {
                    trace!(target: "net", "Reactor cancelled");
                    break Ok(());
                }
                result = self.handle(&mut events, &mut service, &commands, &mut timeouts, &listener) => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
        }
    }

    fn waker(&self) -> Self::Waker {
        self.waker.clone()
    }
}

impl Reactor {
    /// Bind the TCP listener and the UDP socket on the router port.
    async fn listen(&mut self, addr: &SocketAddr) -> Result<net::TcpListener, Error> {
        let listener = net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;

        let udp = net::UdpSocket::bind(local_addr)?;
        udp.set_nonblocking(true)?;

        self.sources
            .register(Source::Listener, &listener, popol::interest::READ);
        self.sources
            .register(Source::Udp, &udp, popol::interest::READ);
        self.udp = Some(udp);

        self.listening.send_async(local_addr).await.ok();

        debug!(target: "net", "Listening on {} (tcp and udp)", local_addr);

        Ok(listener)
    }

    async fn handle<S>(
        &mut self,
        events: &mut Vec<Event<Source>>,
        service: &mut S,
        commands: &Receiver<S::Command>,
        timeouts: &mut Vec<()>,
        listener: &net::TcpListener,
    ) -> Result<(), Error>
    where
        S: Service + Send + Sync,
        S::DisconnectReason: Send + Sync,
    {
        tokio::task::yield_now().await;

        let local_time = LocalTime::from(SystemTime::now());
        let wait = self
            .timeouts
            .next(local_time)
            .unwrap_or(WAIT_TIMEOUT)
            .min(WAIT_TIMEOUT);

        trace!(
            target: "net",
            "Polling {} source(s) and {} timeout(s), waking up in {}..",
            self.sources.len(),
            self.timeouts.len(),
            wait,
        );

        let result = self.sources.wait_timeout(events, wait.into()); // Blocking.
        let local_time = SystemTime::now().into();

        service.tick(local_time);

        match result {
            Ok(n) => {
                trace!(target: "net", "Woke up with {n} source(s) ready");

                for event in events.drain(..) {
                    match &event.key {
                        Source::Peer(addr) => {
                            let addr = *addr;

                            if event.is_invalid() {
                                // File descriptor was closed and is invalid.
                                // Nb. This shouldn't happen. It means the source wasn't
                                // properly unregistered, or there is a duplicate source.
                                error!(target: "net", "{}: Socket is invalid, removing", addr);
                                self.sources.unregister(&event.key);
                                continue;
                            }
                            if event.is_error() || event.is_hangup() {
                                // Let the subsequent read fail.
                                trace!(target: "net", "{}: Socket error triggered: {:?}", addr, event);
                            }
                            if event.is_writable() {
                                self.handle_writable(addr, &event.key, service).await?;
                            }
                            if event.is_readable() {
                                self.handle_readable(addr, service).await;
                            }
                        }
                        Source::Listener => loop {
                            let (conn, socket_addr) = match listener.accept() {
                                Ok((conn, socket_addr)) => (conn, socket_addr),
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(e) => {
                                    error!(target: "net", "Accept error: {}", e.to_string());
                                    break;
                                }
                            };
                            self.accept_connection(service, socket_addr, conn)?;
                        },
                        Source::Udp => self.handle_udp(service).await,
                        Source::Waker => {
                            trace!(target: "net", "Woken up by waker ({} command(s))", commands.len());
                            popol::Waker::reset(event.source).ok();

                            while let Ok(cmd) = commands.try_recv() {
                                service.command_received(cmd).await;
                            }
                        }
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }

        // Service any timers that have come due, whether we woke up
        // for I/O or by timeout.
        self.timeouts.wake(local_time, timeouts);
        if !timeouts.is_empty() {
            timeouts.clear();
            service.timer_expired().await;
        }

        self.process(service, local_time).await;

        Ok(())
    }

    /// Process service state machine outputs.
    async fn process<S>(&mut self, service: &mut S, local_time: LocalTime)
    where
        S: Service,
    {
        // Note that there may be messages destined for a peer that has since been
        // disconnected.
        while let Some(out) = service.next() {
            match out {
                Io::Write(addr, bytes) => {
                    if let Some((socket, source)) = self.peers.get_mut(&addr).and_then(|socket| {
                        self.sources
                            .get_mut(&Source::Peer(addr))
                            .map(|source| (socket, source))
                    }) {
                        socket.push(&bytes);
                        source.set(popol::interest::WRITE);
                    }
                }
                Io::SendUdp(addr, bytes) => {
                    let Some(udp) = &self.udp else { continue };

                    match udp.send_to(&bytes, addr) {
                        Ok(_) => {}
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            // Droppable; the next heartbeat or gossip
                            // round makes up for it.
                            trace!(target: "net", "{}: UDP send would block, dropping", addr);
                        }
                        Err(err) => {
                            trace!(target: "net", "{}: UDP send error: {}", addr, err);
                            service.datagram_send_failed(addr, &err);
                        }
                    }
                }
                Io::Connect(addr) => match dial(&addr) {
                    Ok(stream) => {
                        self.register_peer(addr, stream, Link::Outbound);
                        self.connecting.insert(addr);

                        service.attempted(&addr);
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        // Ignore. We are already establishing a connection
                        // through this socket.
                    }
                    Err(err) => {
                        error!(target: "net", "{}: Dial error: {}", addr, err.to_string());

                        service
                            .disconnected(&addr, Disconnect::DialError(Arc::new(err)))
                            .await;
                    }
                },
                Io::Disconnect(addr, reason) => {
                    // Shutdown the connection, ignoring any potential
                    // errors. If the socket was already disconnected, this
                    // will yield `ENOTCONN`, which is safe to ignore.
                    self.peers.get(&addr).and_then(|peer| peer.disconnect().ok());
                    self.unregister_peer(addr, Disconnect::StateMachine(reason), service)
                        .await;
                }
                Io::SetTimer(timeout) => {
                    self.timeouts.register((), local_time + timeout);
                }
                Io::Event(event) => {
                    trace!(target: "net", "Event: {:?}", event);
                }
            }
        }
    }

    fn accept_connection<S>(
        &mut self,
        service: &mut S,
        socket_addr: SocketAddr,
        conn: net::TcpStream,
    ) -> Result<(), Error>
    where
        S: Service,
    {
        trace!(target: "net", "{}: Accepting peer connection", socket_addr);

        conn.set_nonblocking(true)?;

        let local_addr = conn.local_addr()?;
        let link = Link::Inbound;

        self.register_peer(socket_addr, conn, link);

        service.connected(socket_addr, &local_addr, link);
        Ok(())
    }

    async fn handle_udp<S>(&mut self, service: &mut S)
    where
        S: Service,
    {
        let Some(udp) = &self.udp else { return };
        let mut buffer = [0; UDP_BUFFER_SIZE];

        loop {
            match udp.recv_from(&mut buffer) {
                Ok((count, from)) => {
                    service.datagram_received(from, &buffer[..count]).await;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    trace!(target: "net", "UDP receive error: {}", err);
                    break;
                }
            }
        }
    }

    async fn handle_readable<S>(&mut self, addr: SocketAddr, service: &mut S)
    where
        S: Service,
    {
        // Nb. If the socket was readable and writable at the same time, and it was
        // disconnected during an attempt to write, it will no longer be registered
        // and hence available for reads.
        if let Some(socket) = self.peers.get_mut(&addr) {
            let mut buffer = [0; READ_BUFFER_SIZE];

            trace!(target: "net", "{}: Socket is readable", addr);

            // Nb. Since `poll` is *level-triggered*, we will be notified again if
            // there is still data to be read on the socket. Hence, there is no use
            // in putting this socket read in a loop, as the second invocation would
            // likely block.
            match socket.read(&mut buffer) {
                Ok(count) => {
                    if count > 0 {
                        service
                            .message_received(&addr, std::borrow::Cow::Borrowed(&buffer[..count]))
                            .await;
                    } else {
                        // Zero bytes read means the peer has performed an
                        // orderly shutdown.
                        socket.disconnect().ok();

                        self.unregister_peer(
                            addr,
                            Disconnect::ConnectionError(Arc::new(io::Error::from(
                                io::ErrorKind::ConnectionReset,
                            ))),
                            service,
                        )
                        .await;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // This shouldn't normally happen, since this function is only
                    // called when there's data on the socket.
                }
                Err(err) => {
                    trace!(target: "net", "{}: Read error: {}", addr, err.to_string());

                    socket.disconnect().ok();
                    self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                        .await;
                }
            }
        }
    }

    async fn handle_writable<S: Service>(
        &mut self,
        addr: SocketAddr,
        source: &Source,
        service: &mut S,
    ) -> io::Result<()> {
        trace!(target: "net", "{}: Socket is writable", addr);

        let Some(source) = self.sources.get_mut(source) else {
            return Ok(());
        };
        let Some(socket) = self.peers.get_mut(&addr) else {
            return Ok(());
        };

        // "A file descriptor for a socket that is connecting asynchronously shall
        // indicate that it is ready for writing, once a connection has been
        // established." Since we perform a non-blocking connect, we're only really
        // connected once the socket is writable.
        if self.connecting.remove(&addr) {
            let local_addr = socket.local_address()?;

            service.connected(addr, &local_addr, socket.link);
        }

        match socket.flush() {
            // We've written all the data; we are no longer interested in
            // writing to this socket.
            Ok(()) => {
                source.unset(popol::interest::WRITE);
            }
            // The write couldn't complete. Stay interested in `WRITE` to be
            // notified when the socket is ready to write again.
            Err(err)
                if [io::ErrorKind::WouldBlock, io::ErrorKind::WriteZero].contains(&err.kind()) =>
            {
                source.set(popol::interest::WRITE);
            }
            Err(err) => {
                error!(target: "net", "{}: Write error: {}", addr, err.to_string());

                socket.disconnect().ok();
                self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                    .await;
            }
        }
        Ok(())
    }
}

/// Connect to a peer given a remote address.
fn dial(addr: &SocketAddr) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_read_timeout(Some(READ_TIMEOUT))?;
    sock.set_write_timeout(Some(WRITE_TIMEOUT))?;
    sock.set_nonblocking(true)?;

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}
