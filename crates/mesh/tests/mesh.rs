//! End-to-end exercises of the router state machine: two or more
//! services wired memory-to-memory, with simulated time.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use weave_mesh::client::service::Service;
use weave_mesh::fsm::event::Event;
use weave_mesh::fsm::handler::{Command, Config, DisconnectReason, StateMachine};
use weave_mesh::net::time::RefClock;
use weave_mesh::net::StateMachine as _;
use weave_mesh::net::Service as _;
use weave_mesh::net::{Disconnect, Io, Link, LocalDuration, LocalTime};
use weave_types::PeerName;

fn name(n: u64) -> PeerName {
    PeerName::new(n)
}

fn addr(port: u16) -> SocketAddr {
    ([127, 0, 0, 1], port).into()
}

struct Node {
    service: Service,
    clock: RefClock,
    disconnects: Vec<DisconnectReason>,
}

/// An in-memory network. TCP connections get a distinct ephemeral
/// address on the acceptor side, like the real thing, so simultaneous
/// connects produce two distinguishable connections.
struct SimNet {
    nodes: BTreeMap<SocketAddr, Node>,
    /// `(node, remote addr as the node sees it)` to
    /// `(peer node, our addr as the peer sees it)`.
    links: HashMap<(SocketAddr, SocketAddr), (SocketAddr, SocketAddr)>,
    next_port: u16,
    now: LocalTime,
}

impl SimNet {
    fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            links: HashMap::new(),
            next_port: 40_000,
            now: LocalTime::from_secs(1_000_000),
        }
    }

    fn add(&mut self, n: u64, port: u16, password: Option<&str>) {
        let clock = RefClock::from(self.now);
        let (inject_tx, _inject_rx) = flume::bounded(64);

        let machine = StateMachine::new(
            Config {
                name: name(n),
                nick_name: format!("node-{n}"),
                uid: weave_types::PeerUid(n),
                port,
                password: password.map(|p| p.to_owned()),
                peers: vec![],
                conn_limit: 16,
            },
            fastrand::Rng::with_seed(n),
            clock.clone(),
            inject_tx,
            Vec::new(),
        );

        let mut service = Service::new(machine);
        futures_sync(service.initialize(self.now));

        self.nodes.insert(
            addr(port),
            Node {
                service,
                clock,
                disconnects: Vec::new(),
            },
        );
    }

    /// Open a TCP connection, giving the acceptor an ephemeral view
    /// of the dialer.
    fn open(&mut self, from: SocketAddr, to: SocketAddr) {
        let ephemeral = addr(self.next_port);
        self.next_port += 1;

        self.links.insert((from, to), (to, ephemeral));
        self.links.insert((to, ephemeral), (from, to));

        {
            let dialer = self.nodes.get_mut(&from).unwrap();
            dialer.service.attempted(&to);
            dialer.service.connected(to, &from, Link::Outbound);
        }
        {
            let acceptor = self.nodes.get_mut(&to).unwrap();
            acceptor.service.connected(ephemeral, &to, Link::Inbound);
        }
    }

    /// Drain every node's I/O queue, delivering messages in-memory,
    /// until the network is quiet.
    fn deliver(&mut self) {
        loop {
            let mut progressed = false;
            let addrs: Vec<SocketAddr> = self.nodes.keys().cloned().collect();

            for src in &addrs {
                let mut outputs = Vec::new();
                {
                    let node = self.nodes.get_mut(src).unwrap();
                    while let Some(io) = node.service.next() {
                        outputs.push(io);
                    }
                }

                for io in outputs {
                    progressed = true;
                    match io {
                        Io::Write(dst, bytes) => {
                            let Some((peer, our_addr)) = self.links.get(&(*src, dst)).cloned()
                            else {
                                continue;
                            };
                            let node = self.nodes.get_mut(&peer).unwrap();
                            futures_sync(
                                node.service.message_received(&our_addr, Cow::Owned(bytes)),
                            );
                        }
                        Io::SendUdp(dst, bytes) => {
                            // Datagrams go to the peer's router port and
                            // arrive from ours.
                            if let Some(peer) = self.nodes.get_mut(&dst) {
                                futures_sync(peer.service.datagram_received(*src, &bytes));
                            }
                        }
                        Io::Connect(dst) => {
                            let from = *src;
                            if self.nodes.contains_key(&dst) {
                                self.open(from, dst);
                            } else {
                                let node = self.nodes.get_mut(&from).unwrap();
                                futures_sync(node.service.disconnected(
                                    &dst,
                                    Disconnect::DialError(std::sync::Arc::new(
                                        std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                                    )),
                                ));
                            }
                        }
                        Io::Disconnect(dst, reason) => {
                            let link = self.links.remove(&(*src, dst));
                            {
                                let node = self.nodes.get_mut(src).unwrap();
                                node.disconnects.push(reason.clone());
                                futures_sync(
                                    node.service.disconnected(&dst, reason.clone().into()),
                                );
                            }
                            if let Some((peer, our_addr)) = link {
                                self.links.remove(&(peer, our_addr));
                                let node = self.nodes.get_mut(&peer).unwrap();
                                futures_sync(node.service.disconnected(
                                    &our_addr,
                                    Disconnect::ConnectionError(std::sync::Arc::new(
                                        std::io::Error::from(std::io::ErrorKind::ConnectionReset),
                                    )),
                                ));
                            }
                        }
                        Io::SetTimer(_) | Io::Event(_) => {}
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Advance simulated time and fire every node's timers.
    fn elapse(&mut self, duration: LocalDuration) {
        self.now = self.now + duration;
        for node in self.nodes.values_mut() {
            node.clock.set(self.now);
            node.service.tick(self.now);
            futures_sync(node.service.timer_expired());
        }
    }

    /// Run the network for a while: deliver, tick, deliver.
    fn converge(&mut self, steps: usize, step: LocalDuration) {
        self.deliver();
        for _ in 0..steps {
            self.elapse(step);
            self.deliver();
        }
    }

    fn command(&mut self, at: SocketAddr, cmd: Command) {
        let node = self.nodes.get_mut(&at).unwrap();
        futures_sync(node.service.command_received(cmd));
        self.deliver();
    }

    fn status(&mut self, at: SocketAddr) -> weave_mesh::fsm::handler::StatusReport {
        let (tx, rx) = flume::bounded(1);
        self.command(at, Command::Status(tx));
        rx.try_recv().expect("status reply")
    }

    fn established_peers(&mut self, at: SocketAddr) -> Vec<PeerName> {
        let mut peers: Vec<PeerName> = self
            .status(at)
            .connections
            .iter()
            .filter(|c| c.established)
            .filter_map(|c| c.peer)
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    fn route(&mut self, at: SocketAddr, dst: PeerName) -> Option<PeerName> {
        self.status(at).routes.get(&dst).copied()
    }
}

/// The service's async methods never actually await anything in these
/// tests; run them to completion on the spot.
fn futures_sync<F: std::future::Future>(fut: F) -> F::Output {
    futures::executor::block_on(fut)
}

#[test]
fn two_peers_establish_and_route() {
    let mut net = SimNet::new();
    net.add(1, 7001, None);
    net.add(2, 7002, None);

    net.command(addr(7001), Command::Connect(addr(7002)));
    net.converge(8, LocalDuration::from_millis(500));

    assert_eq!(net.established_peers(addr(7001)), vec![name(2)]);
    assert_eq!(net.established_peers(addr(7002)), vec![name(1)]);

    // Direct neighbours route to themselves.
    assert_eq!(net.route(addr(7001), name(2)), Some(name(2)));
    assert_eq!(net.route(addr(7002), name(1)), Some(name(1)));
}

#[test]
fn simultaneous_connects_leave_one_connection() {
    let mut net = SimNet::new();
    net.add(1, 7001, None);
    net.add(2, 7002, None);

    // Both dial each other at once.
    net.command(addr(7001), Command::Connect(addr(7002)));
    net.command(addr(7002), Command::Connect(addr(7001)));
    net.converge(8, LocalDuration::from_millis(500));

    // Exactly one established connection per pair survives on each
    // side.
    assert_eq!(net.established_peers(addr(7001)), vec![name(2)]);
    assert_eq!(net.established_peers(addr(7002)), vec![name(1)]);

    let established_conns = |net: &mut SimNet, at| {
        net.status(at)
            .connections
            .iter()
            .filter(|c| c.established)
            .count()
    };
    assert_eq!(established_conns(&mut net, addr(7001)), 1);
    assert_eq!(established_conns(&mut net, addr(7002)), 1);

    let dups: usize = net
        .nodes
        .values()
        .flat_map(|n| n.disconnects.iter())
        .filter(|r| matches!(r, DisconnectReason::DuplicateConnection))
        .count();
    assert!(dups >= 1, "the duplicate connection was dropped");
}

#[test]
fn matching_passwords_establish_encrypted() {
    let mut net = SimNet::new();
    net.add(1, 7001, Some("sesame"));
    net.add(2, 7002, Some("sesame"));

    net.command(addr(7001), Command::Connect(addr(7002)));
    net.converge(8, LocalDuration::from_millis(500));

    assert_eq!(net.established_peers(addr(7001)), vec![name(2)]);
    assert_eq!(net.established_peers(addr(7002)), vec![name(1)]);
}

#[test]
fn password_mismatch_fails_the_key_exchange() {
    let mut net = SimNet::new();
    net.add(1, 7001, Some("foo"));
    net.add(2, 7002, Some("bar"));

    net.command(addr(7001), Command::Connect(addr(7002)));
    net.converge(8, LocalDuration::from_millis(500));

    assert!(net.established_peers(addr(7001)).is_empty());
    assert!(net.established_peers(addr(7002)).is_empty());

    let session_failures = net
        .nodes
        .values()
        .flat_map(|n| n.disconnects.iter())
        .filter(|r| matches!(r, DisconnectReason::SessionError))
        .count();
    assert!(session_failures >= 1);
}

#[test]
fn mixed_encryption_is_refused() {
    let mut net = SimNet::new();
    net.add(1, 7001, Some("sesame"));
    net.add(2, 7002, None);

    net.command(addr(7001), Command::Connect(addr(7002)));
    net.converge(4, LocalDuration::from_millis(500));

    assert!(net.established_peers(addr(7001)).is_empty());
    let mismatches = net
        .nodes
        .values()
        .flat_map(|n| n.disconnects.iter())
        .filter(|r| matches!(r, DisconnectReason::EncryptionMismatch))
        .count();
    assert!(mismatches >= 1);
}

#[test]
fn self_connect_is_rejected_and_poisoned() {
    let mut net = SimNet::new();
    net.add(1, 7001, None);

    // The node dials its own address.
    net.command(addr(7001), Command::Connect(addr(7001)));
    net.converge(4, LocalDuration::from_millis(500));

    let selfs = net.nodes[&addr(7001)]
        .disconnects
        .iter()
        .filter(|r| matches!(r, DisconnectReason::SelfConnection))
        .count();
    assert!(selfs >= 1);

    // The poisoned target is never retried.
    net.converge(4, LocalDuration::from_secs(5));
    assert!(net.status(addr(7001)).connections.is_empty());
}

#[test]
fn three_peers_route_around_a_gap() {
    // Line topology: 1 - 2 - 3. Peer 1 reaches 3 through 2.
    let mut net = SimNet::new();
    net.add(1, 7001, None);
    net.add(2, 7002, None);
    net.add(3, 7003, None);

    net.command(addr(7001), Command::Connect(addr(7002)));
    net.command(addr(7003), Command::Connect(addr(7002)));
    net.converge(12, LocalDuration::from_millis(500));

    assert_eq!(net.route(addr(7001), name(3)), Some(name(2)));
    assert_eq!(net.route(addr(7003), name(1)), Some(name(2)));
}

#[test]
fn gossiped_addresses_become_targets() {
    // 1 connects to 2; 3 connects to 2. After gossip, 3 learns the
    // address 2 used to reach... nothing: 2 only holds inbound
    // connections, which advertise no address. Let 2 dial 1 so an
    // address circulates.
    let mut net = SimNet::new();
    net.add(1, 7001, None);
    net.add(2, 7002, None);
    net.add(3, 7003, None);

    net.command(addr(7002), Command::Connect(addr(7001)));
    net.command(addr(7003), Command::Connect(addr(7002)));
    net.converge(12, LocalDuration::from_millis(500));

    // Peer 3 saw 2's outbound edge towards 1 and dialed 1 directly.
    assert_eq!(net.route(addr(7003), name(1)), Some(name(1)));
}

#[test]
fn events_are_observable() {
    // Smoke-check that the aggregated event type renders; the sim
    // discards events, production logs them.
    let event = Event::Ready {
        time: LocalTime::from_secs(1),
    };
    assert!(format!("{event}").contains("Ready"));
}
