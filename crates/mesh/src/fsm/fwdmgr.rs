//! Ethernet frame forwarding: MAC learning, destination resolution
//! and fragment avoidance.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use flume as chan;
use tracing::trace;

use weave_types::message::Datagram;
use weave_types::{Mac, PeerName};

use crate::collections::RandomState;
use crate::net::time::Clock;
use crate::net::{LocalDuration, LocalTime};

use super::output::Wire;
use super::topology::Routes;

/// MAC entries idle for longer than this are expired.
pub const MAC_IDLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(5);
/// Bound on the number of learned MACs; the oldest entry is evicted.
pub const MAC_CACHE_CAPACITY: usize = 1024;

/// Destination name carried by tree-broadcast frames. Reserved; no
/// real peer derives the all-zero name.
pub const BROADCAST: PeerName = PeerName::broadcast();

/// Where the peer owning a MAC can be reached, and how large a
/// datagram the path accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub udp_addr: SocketAddr,
    /// Total datagram budget (the discovered PMTU minus the session
    /// overhead, when encrypted).
    pub max_payload: usize,
}

/// Established peers by name, rebuilt by the handler before each
/// forwarding operation.
pub type Neighbors = BTreeMap<PeerName, Endpoint>;

/// Forwarding statistics, surfaced through the status report.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Counters {
    pub frames_forwarded: u64,
    pub frames_injected: u64,
    pub frames_dropped_no_route: u64,
    pub frames_dropped_oversize: u64,
    pub injects_dropped: u64,
    pub broadcasts_relayed: u64,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    owner: PeerName,
    last_seen: LocalTime,
}

/// Bounded MAC-to-owner learning table with idle expiry.
#[derive(Debug)]
pub struct MacCache {
    entries: HashMap<Mac, CacheEntry, RandomState>,
    capacity: usize,
    idle: LocalDuration,
}

impl MacCache {
    pub fn new(capacity: usize, idle: LocalDuration, rng: fastrand::Rng) -> Self {
        Self {
            entries: HashMap::with_hasher(RandomState::from(rng)),
            capacity,
            idle,
        }
    }

    /// Learn or refresh a MAC. A new owner overwrites the old one:
    /// workloads migrate between peers.
    pub fn learn(&mut self, mac: Mac, owner: PeerName, now: LocalTime) {
        if !self.entries.contains_key(&mac) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(mac, _)| *mac)
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            mac,
            CacheEntry {
                owner,
                last_seen: now,
            },
        );
    }

    /// Look an address up, expiring it if it has been idle too long.
    pub fn lookup(&mut self, mac: &Mac, now: LocalTime) -> Option<PeerName> {
        match self.entries.get(mac) {
            Some(entry) if now - entry.last_seen < self.idle => Some(entry.owner),
            Some(_) => {
                self.entries.remove(mac);
                None
            }
            None => None,
        }
    }

    /// Drop all expired entries.
    pub fn sweep(&mut self, now: LocalTime) {
        let idle = self.idle;
        self.entries.retain(|_, e| now - e.last_seen < idle);
    }

    /// Forget every MAC owned by a departed peer.
    pub fn forget_owner(&mut self, owner: PeerName) {
        self.entries.retain(|_, e| e.owner != owner);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves captured and decapsulated frames to their destinations.
#[derive(Debug)]
pub struct Forwarder<U, C> {
    local: PeerName,
    cache: MacCache,
    counters: Counters,
    /// Frames destined for the local capture device.
    inject: chan::Sender<Vec<u8>>,
    upstream: U,
    clock: C,
}

impl<U: Wire<super::event::Event>, C: Clock> Forwarder<U, C> {
    pub fn new(
        local: PeerName,
        inject: chan::Sender<Vec<u8>>,
        rng: fastrand::Rng,
        upstream: U,
        clock: C,
    ) -> Self {
        Self {
            local,
            cache: MacCache::new(MAC_CACHE_CAPACITY, MAC_IDLE_TIMEOUT, rng),
            counters: Counters::default(),
            inject,
            upstream,
            clock,
        }
    }

    /// A frame was captured on the local device.
    pub fn frame_captured(&mut self, frame: Vec<u8>, routes: &Routes, neighbors: &Neighbors) {
        let now = self.clock.local_time();

        let (Some(dst), Some(src)) = (Mac::frame_dst(&frame), Mac::frame_src(&frame)) else {
            trace!(target: "mesh", "Captured a runt frame, dropping");
            return;
        };
        self.cache.learn(src, self.local, now);

        if dst.is_multicast() {
            self.broadcast(self.local, frame, routes, neighbors);
            return;
        }
        match self.cache.lookup(&dst, now) {
            Some(owner) if owner == self.local => {
                // Already on the local segment; the bridge has done
                // the delivery.
            }
            Some(owner) => self.unicast(owner, frame, routes, neighbors),
            None => self.broadcast(self.local, frame, routes, neighbors),
        }
    }

    /// A decapsulated frame arrived from another peer.
    pub fn frame_received(
        &mut self,
        src: PeerName,
        dst: PeerName,
        frame: Vec<u8>,
        routes: &Routes,
        neighbors: &Neighbors,
    ) {
        let now = self.clock.local_time();

        if let Some(src_mac) = Mac::frame_src(&frame) {
            self.cache.learn(src_mac, src, now);
        }

        if dst == BROADCAST {
            self.deliver(frame.clone());
            // Relay down our subtree of the tree rooted at the
            // originator; the tree guarantees loop freedom.
            self.broadcast(src, frame, routes, neighbors);
        } else if dst == self.local {
            self.deliver(frame);
        } else {
            // In-transit frame: forward with our own tables. If we
            // can't resolve it, drop rather than risk a loop.
            self.forward(src, dst, frame, routes, neighbors);
        }
    }

    /// Send a frame towards the peer owning its destination MAC.
    fn unicast(&mut self, owner: PeerName, frame: Vec<u8>, routes: &Routes, neighbors: &Neighbors) {
        self.forward(self.local, owner, frame, routes, neighbors)
    }

    fn forward(
        &mut self,
        src: PeerName,
        dst: PeerName,
        frame: Vec<u8>,
        routes: &Routes,
        neighbors: &Neighbors,
    ) {
        let hop = if neighbors.contains_key(&dst) {
            dst
        } else {
            match routes.next_hop(&dst) {
                Some(hop) => hop,
                None => {
                    self.counters.frames_dropped_no_route += 1;
                    return;
                }
            }
        };
        let Some(endpoint) = neighbors.get(&hop) else {
            self.counters.frames_dropped_no_route += 1;
            return;
        };

        if Datagram::FRAME_OVERHEAD + frame.len() > endpoint.max_payload {
            self.counters.frames_dropped_oversize += 1;
            return;
        }

        self.upstream.frame(endpoint.udp_addr, src, dst, frame);
        self.counters.frames_forwarded += 1;
    }

    /// Fan a frame out along the spanning tree rooted at `origin`.
    fn broadcast(
        &mut self,
        origin: PeerName,
        frame: Vec<u8>,
        routes: &Routes,
        neighbors: &Neighbors,
    ) {
        for child in routes.broadcast_children(&origin) {
            let Some(endpoint) = neighbors.get(child) else {
                continue;
            };
            if Datagram::FRAME_OVERHEAD + frame.len() > endpoint.max_payload {
                self.counters.frames_dropped_oversize += 1;
                continue;
            }
            self.upstream
                .frame(endpoint.udp_addr, origin, BROADCAST, frame.clone());
            self.counters.broadcasts_relayed += 1;
        }
    }

    /// Hand a frame to the local capture device. A full inject queue
    /// drops the frame rather than stall the packet path.
    fn deliver(&mut self, frame: Vec<u8>) {
        match self.inject.try_send(frame) {
            Ok(()) => self.counters.frames_injected += 1,
            Err(_) => self.counters.injects_dropped += 1,
        }
    }

    /// Periodic maintenance: expire idle MAC entries.
    pub fn received_wake(&mut self) {
        let now = self.clock.local_time();
        self.cache.sweep(now);
    }

    /// A peer left the mesh; un-learn its MACs so traffic for them
    /// falls back to broadcast.
    pub fn peer_removed(&mut self, name: PeerName) {
        self.cache.forget_owner(name);
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::{Io, Outbox, WireMsg};
    use crate::net::time::RefClock;
    use weave_types::{ConnectionSummary, Peer, PeerUid};

    use crate::fsm::topology::Topology;

    fn name(n: u64) -> PeerName {
        PeerName::new(n)
    }

    fn frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut frame = vec![0u8; 64];
        frame[0..6].copy_from_slice(&dst);
        frame[6..12].copy_from_slice(&src);
        frame
    }

    fn routes_with_neighbor() -> (Routes, Neighbors) {
        let mut topology = Topology::new(name(1), "local", PeerUid(1));
        topology.record_connection(name(2), None, true);

        let mut two = Peer::new(name(2), "b", PeerUid(2));
        two.version = 1;
        two.connections.insert(
            name(1),
            ConnectionSummary {
                addr: None,
                established: true,
            },
        );
        topology.apply_update(vec![two]).unwrap();

        let routes = Routes::compute(&topology);
        let mut neighbors = Neighbors::new();
        neighbors.insert(
            name(2),
            Endpoint {
                udp_addr: ([10, 0, 0, 2], 6783).into(),
                max_payload: 1410,
            },
        );
        (routes, neighbors)
    }

    fn forwarder() -> (
        Forwarder<Outbox, RefClock>,
        Outbox,
        chan::Receiver<Vec<u8>>,
    ) {
        let clock = RefClock::from(crate::net::LocalTime::from_secs(1_000));
        let outbox = Outbox::new();
        let (inject_tx, inject_rx) = chan::bounded(8);
        let fwd = Forwarder::new(
            name(1),
            inject_tx,
            fastrand::Rng::with_seed(1),
            outbox.clone(),
            clock,
        );
        (fwd, outbox, inject_rx)
    }

    fn sent_frames(outbox: &mut Outbox) -> Vec<(SocketAddr, PeerName, PeerName, usize)> {
        outbox
            .by_ref()
            .filter_map(|io| match io {
                Io::SendUdp(addr, WireMsg::Datagram(Datagram::Frame { src, dst, frame }, _)) => {
                    Some((addr, src, dst, frame.len()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn known_mac_goes_straight_to_its_owner() {
        let (mut fwd, mut outbox, _inject) = forwarder();
        let (routes, neighbors) = routes_with_neighbor();

        // Learn the MAC from a decapsulated frame first.
        let learned = frame([2; 6], [9; 6]);
        fwd.frame_received(name(2), name(1), learned, &routes, &neighbors);

        let outgoing = frame([9; 6], [2; 6]);
        fwd.frame_captured(outgoing, &routes, &neighbors);

        let sent = sent_frames(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, name(1));
        assert_eq!(sent[0].2, name(2));
        assert_eq!(fwd.counters().frames_forwarded, 1);
    }

    #[test]
    fn unknown_mac_falls_back_to_broadcast() {
        let (mut fwd, mut outbox, _inject) = forwarder();
        let (routes, neighbors) = routes_with_neighbor();

        fwd.frame_captured(frame([9; 6], [2; 6]), &routes, &neighbors);

        let sent = sent_frames(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, BROADCAST);
    }

    #[test]
    fn oversize_frames_are_dropped_and_counted() {
        let (mut fwd, mut outbox, _inject) = forwarder();
        let (routes, neighbors) = routes_with_neighbor();

        // Learn a remote MAC, then push a frame that exceeds the path
        // budget.
        fwd.frame_received(name(2), name(1), frame([2; 6], [8; 6]), &routes, &neighbors);

        let mut big = frame([8; 6], [7; 6]);
        big.resize(2_000, 0);
        fwd.frame_captured(big, &routes, &neighbors);

        assert!(sent_frames(&mut outbox).is_empty());
        assert_eq!(fwd.counters().frames_dropped_oversize, 1);

        // A frame within the budget goes through.
        let mut ok = frame([8; 6], [7; 6]);
        ok.resize(1_380, 0);
        fwd.frame_captured(ok, &routes, &neighbors);
        assert_eq!(sent_frames(&mut outbox).len(), 1);
    }

    #[test]
    fn frames_for_us_are_injected() {
        let (mut fwd, _outbox, inject) = forwarder();
        let (routes, neighbors) = routes_with_neighbor();

        fwd.frame_received(name(2), name(1), frame([1; 6], [2; 6]), &routes, &neighbors);

        assert_eq!(inject.try_recv().unwrap().len(), 64);
        assert_eq!(fwd.counters().frames_injected, 1);
    }

    #[test]
    fn mac_cache_expires_and_evicts() {
        let mut cache = MacCache::new(2, MAC_IDLE_TIMEOUT, fastrand::Rng::with_seed(3));
        let t0 = LocalTime::from_secs(0);

        cache.learn(Mac::new([1; 6]), name(1), t0);
        cache.learn(
            Mac::new([2; 6]),
            name(2),
            t0 + LocalDuration::from_secs(1),
        );
        // Third entry evicts the oldest.
        cache.learn(
            Mac::new([3; 6]),
            name(3),
            t0 + LocalDuration::from_secs(2),
        );
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup(&Mac::new([1; 6]), t0 + LocalDuration::from_secs(2)), None);

        // Owner migration.
        cache.learn(
            Mac::new([2; 6]),
            name(9),
            t0 + LocalDuration::from_secs(3),
        );
        assert_eq!(
            cache.lookup(&Mac::new([2; 6]), t0 + LocalDuration::from_secs(3)),
            Some(name(9))
        );

        // Idle expiry.
        let late = t0 + MAC_IDLE_TIMEOUT + LocalDuration::from_secs(10);
        assert_eq!(cache.lookup(&Mac::new([2; 6]), late), None);
    }

    #[test]
    fn full_inject_queue_drops_and_counts() {
        let (mut fwd, _outbox, inject) = forwarder();
        let (routes, neighbors) = routes_with_neighbor();

        for _ in 0..10 {
            fwd.frame_received(name(2), name(1), frame([1; 6], [2; 6]), &routes, &neighbors);
        }
        assert_eq!(fwd.counters().injects_dropped, 2);
        assert_eq!(inject.len(), 8);
    }
}
