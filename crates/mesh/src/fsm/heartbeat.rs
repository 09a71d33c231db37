//! UDP liveness probes and PMTU discovery.
//!
//! Every greeted peer is probed every 500ms with a heartbeat padded to
//! the current PMTU. Receiving the peer's heartbeat proves its UDP
//! path towards us; we acknowledge over TCP so it can mark the
//! connection established. Losing six heartbeats in a row kills the
//! connection.
//!
//! PMTU starts at 1410 and only ever shrinks: a padded probe is
//! acknowledged over TCP, and an unacknowledged or oversized probe
//! halves the candidate down to a floor.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::fsm::handler::DisconnectReason;
use crate::net::time::Clock;
use crate::net::LocalDuration;

use super::output::{Disconnect, SetTimer, Wire};

/// Interval between heartbeats.
pub const HEARTBEAT_INTERVAL: LocalDuration = LocalDuration::from_millis(500);
/// Six consecutive losses terminate the connection.
pub const HEARTBEAT_TIMEOUT: LocalDuration = LocalDuration::from_millis(3_000);
/// Initial path MTU estimate.
pub const PMTU_INITIAL: u16 = 1410;
/// PMTU is never probed below this.
pub const PMTU_FLOOR: u16 = 576;
/// An unacknowledged PMTU probe halves the candidate after this long.
pub const PMTU_VERIFY_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Pmtu {
    /// Size currently being probed, or the verified size.
    candidate: u16,
    /// Probe acknowledged at this size.
    verified: Option<u16>,
    probe_sent: Option<crate::net::LocalTime>,
}

#[derive(Debug)]
struct PeerState {
    udp_addr: SocketAddr,
    last_sent: Option<crate::net::LocalTime>,
    last_received: Option<crate::net::LocalTime>,
    /// Whether we've already told the peer its UDP path works.
    acknowledged: bool,
    pmtu: Pmtu,
}

/// Drives heartbeats and PMTU probes for greeted peers.
#[derive(Debug)]
pub struct HeartbeatManager<U, C> {
    peers: HashMap<SocketAddr, PeerState>,
    upstream: U,
    clock: C,
}

impl<U: Wire<super::event::Event> + SetTimer + Disconnect, C: Clock> HeartbeatManager<U, C> {
    pub fn new(upstream: U, clock: C) -> Self {
        Self {
            peers: HashMap::new(),
            upstream,
            clock,
        }
    }

    /// Start probing a peer that has completed the greeting exchange.
    pub fn peer_greeted(&mut self, addr: SocketAddr, udp_addr: SocketAddr) {
        let now = self.clock.local_time();
        let pmtu = Pmtu {
            candidate: PMTU_INITIAL,
            verified: None,
            probe_sent: Some(now),
        };

        self.upstream.heartbeat(udp_addr, PMTU_INITIAL as usize);
        self.upstream.frag_test(udp_addr, PMTU_INITIAL as usize);

        self.peers.insert(
            addr,
            PeerState {
                udp_addr,
                last_sent: Some(now),
                last_received: None,
                acknowledged: false,
                pmtu,
            },
        );
        self.upstream.set_timer(HEARTBEAT_INTERVAL);
    }

    pub fn peer_disconnected(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    /// A heartbeat arrived from the peer. Returns `true` the first
    /// time, so the caller can acknowledge over TCP.
    pub fn heartbeat_received(&mut self, addr: &SocketAddr) -> bool {
        let now = self.clock.local_time();
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };

        peer.last_received = Some(now);
        if !peer.acknowledged {
            peer.acknowledged = true;
            return true;
        }
        false
    }

    /// A PMTU probe of `size` bytes made it through from the peer;
    /// the caller acknowledges with the observed size over TCP.
    pub fn frag_test_received(&self, addr: &SocketAddr, size: usize) -> Option<u16> {
        self.peers.get(addr)?;
        Some(size.min(u16::MAX as usize) as u16)
    }

    /// The peer acknowledged our probe of the given size.
    pub fn pmtu_verified(&mut self, addr: &SocketAddr, size: u16) {
        if let Some(peer) = self.peers.get_mut(addr) {
            let size = size.min(peer.pmtu.candidate);
            peer.pmtu.verified = Some(size);
            peer.pmtu.candidate = size;
            peer.pmtu.probe_sent = None;
        }
    }

    /// The kernel refused a datagram of the current size (`EMSGSIZE`).
    /// Halve immediately and re-probe.
    pub fn send_failed_oversize(&mut self, udp_addr: &SocketAddr) {
        let Some(peer) = self
            .peers
            .values_mut()
            .find(|p| p.udp_addr == *udp_addr)
        else {
            return;
        };

        peer.pmtu.candidate = (peer.pmtu.candidate / 2).max(PMTU_FLOOR);
        peer.pmtu.verified = None;
        peer.pmtu.probe_sent = Some(self.clock.local_time());
        self.upstream
            .frag_test(peer.udp_addr, peer.pmtu.candidate as usize);
    }

    /// Effective datagram size budget towards a peer.
    pub fn pmtu(&self, addr: &SocketAddr) -> usize {
        self.peers
            .get(addr)
            .map(|p| p.pmtu.verified.unwrap_or(p.pmtu.candidate) as usize)
            .unwrap_or(PMTU_INITIAL as usize)
    }

    /// Called on a timer tick: send due heartbeats, retry stale PMTU
    /// probes, and terminate silent peers.
    pub fn received_wake(&mut self) {
        let now = self.clock.local_time();
        let mut dead = Vec::new();

        for (addr, peer) in self.peers.iter_mut() {
            if let Some(received) = peer.last_received {
                if now - received >= HEARTBEAT_TIMEOUT {
                    dead.push(*addr);
                    continue;
                }
            }

            let due = match peer.last_sent {
                Some(sent) => now - sent >= HEARTBEAT_INTERVAL,
                None => true,
            };
            if due {
                let size = peer.pmtu.verified.unwrap_or(peer.pmtu.candidate) as usize;
                self.upstream.heartbeat(peer.udp_addr, size);
                peer.last_sent = Some(now);
            }

            if peer.pmtu.verified.is_none() {
                if let Some(sent) = peer.pmtu.probe_sent {
                    if now - sent >= PMTU_VERIFY_TIMEOUT {
                        peer.pmtu.candidate = (peer.pmtu.candidate / 2).max(PMTU_FLOOR);
                        peer.pmtu.probe_sent = Some(now);
                        self.upstream
                            .frag_test(peer.udp_addr, peer.pmtu.candidate as usize);
                    }
                }
            }
        }

        for addr in dead {
            self.upstream
                .disconnect(addr, DisconnectReason::HeartbeatTimeout);
        }

        if !self.peers.is_empty() {
            self.upstream.set_timer(HEARTBEAT_INTERVAL);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
