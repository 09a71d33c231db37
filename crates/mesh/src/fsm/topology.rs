//! The gossiped peer topology and the routing tables derived from it.
//!
//! The topology is a directed graph: each peer advertises the
//! connections *it* has. Routing only ever uses symmetric edges, where
//! both endpoints advertise each other as established.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;

use thiserror::Error;

use weave_types::wire::{self, Decodable, Encodable};
use weave_types::{ConnectionSummary, Peer, PeerName, PeerUid};

#[derive(Debug, Error)]
pub enum Error {
    /// Same name, same version, different payload. The connection that
    /// delivered this update is misbehaving.
    #[error("conflicting update for {0} at equal version")]
    Conflict(PeerName),
    #[error(transparent)]
    Decode(#[from] wire::Error),
}

/// The set of peers known to this router, keyed by name. The local
/// peer's own record lives in the same map and is the only one this
/// router mutates directly.
#[derive(Debug)]
pub struct Topology {
    local_name: PeerName,
    peers: BTreeMap<PeerName, Peer>,
}

impl Topology {
    pub fn new(name: PeerName, nick_name: impl Into<String>, uid: PeerUid) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(name, Peer::new(name, nick_name, uid));

        Self {
            local_name: name,
            peers,
        }
    }

    pub fn local_name(&self) -> PeerName {
        self.local_name
    }

    pub fn local(&self) -> &Peer {
        &self.peers[&self.local_name]
    }

    pub fn get(&self, name: &PeerName) -> Option<&Peer> {
        self.peers.get(name)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Merge a set of received peer records.
    ///
    /// Returns the names whose records improved, which is exactly the
    /// set worth re-gossiping. Records about the local peer are
    /// ignored: this router is the sole authority on itself and
    /// re-asserts its own record through periodic gossip.
    pub fn apply_update(&mut self, updates: Vec<Peer>) -> Result<Vec<PeerName>, Error> {
        let mut changed = Vec::new();

        for update in updates {
            if update.name == self.local_name {
                continue;
            }
            match self.peers.get(&update.name) {
                None => {
                    changed.push(update.name);
                    self.peers.insert(update.name, update);
                }
                Some(known) => {
                    if known.uid != update.uid {
                        // A new incarnation of the peer; its version
                        // counter restarted with it.
                        changed.push(update.name);
                        self.peers.insert(update.name, update);
                    } else if update.version > known.version {
                        changed.push(update.name);
                        self.peers.insert(update.name, update);
                    } else if update.version == known.version && *known != update {
                        return Err(Error::Conflict(update.name));
                    }
                }
            }
        }

        if !changed.is_empty() {
            self.garbage_collect();
            changed.retain(|name| self.peers.contains_key(name));
        }
        Ok(changed)
    }

    /// Record or update a local connection edge, bumping our version.
    pub fn record_connection(
        &mut self,
        remote: PeerName,
        addr: Option<SocketAddr>,
        established: bool,
    ) {
        let local = self
            .peers
            .get_mut(&self.local_name)
            .expect("the local record always exists");
        local.version += 1;
        local
            .connections
            .insert(remote, ConnectionSummary { addr, established });
    }

    /// Remove a local connection edge, bumping our version.
    pub fn remove_connection(&mut self, remote: PeerName) {
        let local = self
            .peers
            .get_mut(&self.local_name)
            .expect("the local record always exists");
        if local.connections.remove(&remote).is_some() {
            local.version += 1;
        }
        self.garbage_collect();
    }

    /// Drop peers no longer reachable from the local peer in the
    /// directed graph. Without this, records of departed peers are
    /// retained forever and resurrect through gossip echo.
    fn garbage_collect(&mut self) {
        let mut reachable = BTreeSet::new();
        let mut queue = VecDeque::new();

        reachable.insert(self.local_name);
        queue.push_back(self.local_name);

        while let Some(name) = queue.pop_front() {
            let Some(peer) = self.peers.get(&name) else { continue };
            for next in peer.connections.keys() {
                if self.peers.contains_key(next) && reachable.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }

        self.peers.retain(|name, _| reachable.contains(name));
    }

    /// Encode the given peer records for gossip.
    pub fn encode_peers<'a>(
        &self,
        names: impl IntoIterator<Item = &'a PeerName>,
    ) -> Vec<u8> {
        let peers: Vec<&Peer> = names
            .into_iter()
            .filter_map(|name| self.peers.get(name))
            .collect();

        let mut buf = Vec::new();
        (peers.len() as u32)
            .encode(&mut buf)
            .expect("writing to an in-memory buffer doesn't fail");
        for peer in peers {
            peer.encode(&mut buf)
                .expect("writing to an in-memory buffer doesn't fail");
        }
        buf
    }

    /// Encode the entire peer set for the periodic gossip round.
    pub fn encode_all(&self) -> Vec<u8> {
        let names: Vec<PeerName> = self.peers.keys().cloned().collect();
        self.encode_peers(names.iter())
    }

    /// Decode a gossiped update payload.
    pub fn decode_update(payload: &[u8]) -> Result<Vec<Peer>, wire::Error> {
        let mut r = payload;
        let count = u32::decode(&mut r)?;
        let mut peers = Vec::new();
        for _ in 0..count {
            peers.push(Peer::decode(&mut r)?);
        }
        Ok(peers)
    }
}

/// Routing tables computed from the symmetric-edge subgraph.
#[derive(Debug, Default, Clone)]
pub struct Routes {
    /// Destination to next hop, shortest path, smallest next-hop name
    /// on ties. Unreachable destinations are absent.
    unicast: BTreeMap<PeerName, PeerName>,
    /// For each broadcast source: the local peer's children in the
    /// spanning tree rooted at that source.
    broadcast: BTreeMap<PeerName, Vec<PeerName>>,
}

impl Routes {
    pub fn compute(topology: &Topology) -> Self {
        let local = topology.local_name();
        let adjacency = symmetric_adjacency(topology);

        let unicast = unicast_routes(&adjacency, local);

        let mut broadcast = BTreeMap::new();
        for src in topology.peers().map(|p| p.name) {
            broadcast.insert(src, tree_children(&adjacency, src, local));
        }

        Self { unicast, broadcast }
    }

    pub fn next_hop(&self, dst: &PeerName) -> Option<PeerName> {
        self.unicast.get(dst).copied()
    }

    /// The local peer's children in the broadcast tree rooted at
    /// `src`. Forwarding a broadcast only to these bounds the whole
    /// fan-out to N-1 sends network-wide.
    pub fn broadcast_children(&self, src: &PeerName) -> &[PeerName] {
        self.broadcast.get(src).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn unicast(&self) -> &BTreeMap<PeerName, PeerName> {
        &self.unicast
    }
}

/// Symmetric adjacency: an edge exists when both endpoints advertise
/// each other as established.
fn symmetric_adjacency(topology: &Topology) -> BTreeMap<PeerName, BTreeSet<PeerName>> {
    let mut adjacency: BTreeMap<PeerName, BTreeSet<PeerName>> = BTreeMap::new();

    for peer in topology.peers() {
        for other in peer.established() {
            let reciprocal = topology
                .get(&other)
                .map(|o| {
                    o.connections
                        .get(&peer.name)
                        .map(|c| c.established)
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            if reciprocal {
                adjacency.entry(peer.name).or_default().insert(other);
                adjacency.entry(other).or_default().insert(peer.name);
            }
        }
    }
    adjacency
}

/// BFS from the local peer; on equal distance the smallest next-hop
/// name wins.
fn unicast_routes(
    adjacency: &BTreeMap<PeerName, BTreeSet<PeerName>>,
    local: PeerName,
) -> BTreeMap<PeerName, PeerName> {
    let mut dist: BTreeMap<PeerName, usize> = BTreeMap::new();
    let mut hops: BTreeMap<PeerName, PeerName> = BTreeMap::new();

    dist.insert(local, 0);

    let mut frontier = vec![local];
    let mut depth = 0;

    while !frontier.is_empty() {
        depth += 1;
        let mut next_frontier = BTreeSet::new();

        for node in &frontier {
            let Some(neighbors) = adjacency.get(node) else { continue };
            for neighbor in neighbors {
                if !dist.contains_key(neighbor) {
                    next_frontier.insert(*neighbor);
                }
            }
        }

        for node in &next_frontier {
            dist.insert(*node, depth);
        }
        // The next hop towards a node is the smallest next hop of any
        // of its predecessors; for direct neighbours it is the node
        // itself.
        for node in &next_frontier {
            let hop = adjacency[node]
                .iter()
                .filter(|p| dist.get(*p) == Some(&(depth - 1)))
                .map(|p| if *p == local { *node } else { hops[p] })
                .min()
                .expect("a discovered node has a predecessor");
            hops.insert(*node, hop);
        }

        frontier = next_frontier.into_iter().collect();
    }

    hops
}

/// The local peer's children in the BFS tree rooted at `src`, with the
/// deterministic parent rule: a node's parent is its smallest-named
/// neighbour in the previous layer. Every peer derives the same tree
/// from the same topology.
fn tree_children(
    adjacency: &BTreeMap<PeerName, BTreeSet<PeerName>>,
    src: PeerName,
    local: PeerName,
) -> Vec<PeerName> {
    let mut dist: BTreeMap<PeerName, usize> = BTreeMap::new();
    let mut parent: BTreeMap<PeerName, PeerName> = BTreeMap::new();

    dist.insert(src, 0);

    let mut frontier = vec![src];
    let mut depth = 0;

    while !frontier.is_empty() {
        depth += 1;
        let mut next_frontier = BTreeSet::new();

        for node in &frontier {
            let Some(neighbors) = adjacency.get(node) else { continue };
            for neighbor in neighbors {
                if !dist.contains_key(neighbor) {
                    next_frontier.insert(*neighbor);
                }
            }
        }

        for node in &next_frontier {
            dist.insert(*node, depth);
            let p = adjacency[node]
                .iter()
                .filter(|p| dist.get(*p) == Some(&(depth - 1)))
                .min()
                .expect("a discovered node has a predecessor");
            parent.insert(*node, *p);
        }

        frontier = next_frontier.into_iter().collect();
    }

    parent
        .iter()
        .filter(|(_, p)| **p == local)
        .map(|(child, _)| *child)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    fn name(n: u64) -> PeerName {
        PeerName::new(n)
    }

    /// Build a topology where the given undirected edges are
    /// established in both directions.
    fn mesh(local: u64, edges: &[(u64, u64)]) -> Topology {
        let mut peers: BTreeMap<u64, Peer> = BTreeMap::new();
        let mut ensure = |peers: &mut BTreeMap<u64, Peer>, n: u64| {
            peers
                .entry(n)
                .or_insert_with(|| Peer::new(name(n), format!("peer-{n}"), PeerUid(n)));
        };

        for &(a, b) in edges {
            ensure(&mut peers, a);
            ensure(&mut peers, b);
            for (x, y) in [(a, b), (b, a)] {
                peers.get_mut(&x).unwrap().connections.insert(
                    name(y),
                    ConnectionSummary {
                        addr: None,
                        established: true,
                    },
                );
            }
        }
        ensure(&mut peers, local);

        let mut topology = Topology::new(name(local), "local", PeerUid(local));
        let mut records: Vec<Peer> = peers.into_values().filter(|p| p.name != name(local)).collect();
        // Give every record a version so it merges.
        for r in records.iter_mut() {
            r.version = 1;
        }
        // The local record is authoritative; copy its edges in directly.
        let local_edges: Vec<u64> = edges
            .iter()
            .flat_map(|&(a, b)| [(a, b), (b, a)])
            .filter(|&(a, _)| a == local)
            .map(|(_, b)| b)
            .collect();
        for b in local_edges {
            topology.record_connection(name(b), None, true);
        }
        topology.apply_update(records).unwrap();
        topology
    }

    #[test]
    fn merge_inserts_and_replaces_by_version() {
        let mut topology = Topology::new(name(1), "a", PeerUid(1));

        let mut peer = Peer::new(name(2), "b", PeerUid(2));
        peer.version = 1;
        peer.connections.insert(
            name(1),
            ConnectionSummary {
                addr: None,
                established: false,
            },
        );
        topology.record_connection(name(2), None, false);

        assert_eq!(topology.apply_update(vec![peer.clone()]).unwrap(), vec![name(2)]);

        // Lower version is ignored.
        let mut stale = peer.clone();
        stale.version = 0;
        assert!(topology.apply_update(vec![stale]).unwrap().is_empty());

        // Higher version replaces.
        let mut newer = peer.clone();
        newer.version = 5;
        newer.nick_name = "b2".into();
        assert_eq!(topology.apply_update(vec![newer.clone()]).unwrap(), vec![name(2)]);
        assert_eq!(topology.get(&name(2)).unwrap().nick_name, "b2");

        // Equal version with a different payload is a violation.
        let mut conflicting = newer;
        conflicting.nick_name = "evil".into();
        assert!(matches!(
            topology.apply_update(vec![conflicting]).unwrap_err(),
            Error::Conflict(conflicted) if conflicted == name(2)
        ));
    }

    #[test]
    fn new_incarnation_replaces_regardless_of_version() {
        let mut topology = Topology::new(name(1), "a", PeerUid(1));
        topology.record_connection(name(2), None, true);

        let mut old = Peer::new(name(2), "b", PeerUid(100));
        old.version = 50;
        old.connections.insert(
            name(1),
            ConnectionSummary { addr: None, established: true },
        );
        topology.apply_update(vec![old]).unwrap();

        let mut reborn = Peer::new(name(2), "b", PeerUid(200));
        reborn.version = 1;
        reborn.connections.insert(
            name(1),
            ConnectionSummary { addr: None, established: true },
        );
        assert_eq!(topology.apply_update(vec![reborn]).unwrap(), vec![name(2)]);
        assert_eq!(topology.get(&name(2)).unwrap().uid, PeerUid(200));
    }

    #[test]
    fn unreachable_peers_are_collected() {
        let mut topology = mesh(1, &[(1, 2), (2, 3)]);
        assert_eq!(topology.len(), 3);

        // Peer 2 drops its edge to 3; 3 becomes unreachable.
        let mut two = topology.get(&name(2)).unwrap().clone();
        two.version += 1;
        two.connections.remove(&name(3));
        topology.apply_update(vec![two]).unwrap();

        assert!(topology.get(&name(3)).is_none());
        assert_eq!(topology.len(), 2);
    }

    #[test]
    fn update_encoding_roundtrip() {
        let topology = mesh(1, &[(1, 2), (2, 3)]);
        let bytes = topology.encode_all();
        let decoded = Topology::decode_update(&bytes).unwrap();
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn routes_prefer_the_smallest_next_hop() {
        // 1 is connected to 2 and 3; both reach 4.
        let topology = mesh(1, &[(1, 2), (1, 3), (2, 4), (3, 4)]);
        let routes = Routes::compute(&topology);

        assert_eq!(routes.next_hop(&name(2)), Some(name(2)));
        assert_eq!(routes.next_hop(&name(4)), Some(name(2)));
    }

    #[test]
    fn asymmetric_edges_are_not_routed() {
        let mut topology = Topology::new(name(1), "a", PeerUid(1));
        topology.record_connection(name(2), None, true);

        // Peer 2 exists but does not advertise us back.
        let mut two = Peer::new(name(2), "b", PeerUid(2));
        two.version = 1;
        two.connections.insert(
            name(1),
            ConnectionSummary { addr: None, established: false },
        );
        topology.apply_update(vec![two]).unwrap();

        let routes = Routes::compute(&topology);
        assert_eq!(routes.next_hop(&name(2)), None);
    }

    #[test]
    fn triangle_heals_through_the_middle() {
        // Full triangle; drop 1-3, traffic to 3 goes via 2.
        let mut topology = mesh(1, &[(1, 2), (1, 3), (2, 3)]);
        let routes = Routes::compute(&topology);
        assert_eq!(routes.next_hop(&name(3)), Some(name(3)));

        topology.remove_connection(name(3));
        let mut three = topology.get(&name(3)).unwrap().clone();
        three.version += 1;
        three.connections.remove(&name(1));
        topology.apply_update(vec![three]).unwrap();

        let routes = Routes::compute(&topology);
        assert_eq!(routes.next_hop(&name(3)), Some(name(2)));
    }

    #[test]
    fn broadcast_tree_bounds_fanout() {
        // Star around 2: a broadcast from 1 reaches 3 and 4 through 2
        // only.
        let topology = mesh(2, &[(1, 2), (2, 3), (2, 4)]);
        let routes = Routes::compute(&topology);

        assert_eq!(routes.broadcast_children(&name(1)), &[name(3), name(4)]);
        // From our own broadcasts, all three are children.
        assert_eq!(
            routes.broadcast_children(&name(2)),
            &[name(1), name(3), name(4)]
        );

        // Leaf view: peer 1 relays nothing for source 1 beyond its
        // parent 2.
        let leaf = mesh(1, &[(1, 2), (2, 3), (2, 4)]);
        let leaf_routes = Routes::compute(&leaf);
        assert_eq!(leaf_routes.broadcast_children(&name(1)), &[name(2)]);
        assert_eq!(leaf_routes.broadcast_children(&name(3)), &[] as &[PeerName]);
    }

    /// A random undirected graph over a small name space.
    #[derive(Debug, Clone)]
    struct Graph {
        edges: Vec<(u64, u64)>,
    }

    impl Arbitrary for Graph {
        fn arbitrary(g: &mut Gen) -> Self {
            let n = u64::arbitrary(g) % 8 + 2;
            let mut edges = Vec::new();
            for a in 1..=n {
                for b in a + 1..=n {
                    if bool::arbitrary(g) {
                        edges.push((a, b));
                    }
                }
            }
            // Always keep the local peer attached to something so the
            // graph isn't trivially empty.
            edges.push((1, 2));
            Graph { edges }
        }
    }

    quickcheck::quickcheck! {
        /// Applying peer records in any order yields the same final
        /// topology, once a full-state round has been delivered (single
        /// out-of-order records can be transiently dropped as
        /// unreachable; the periodic full gossip recovers them).
        fn prop_merge_order_independent(graph: Graph, seed: u64) -> bool {
            let reference = mesh(1, &graph.edges);
            let all: Vec<Peer> = reference
                .peers()
                .filter(|p| p.name != name(1))
                .cloned()
                .collect();
            let mut records = all.clone();

            let mut rng = fastrand::Rng::with_seed(seed);
            rng.shuffle(&mut records);

            let mut topology = Topology::new(name(1), "local", PeerUid(1));
            for (peer, summary) in reference.local().connections.iter() {
                topology.record_connection(*peer, summary.addr, summary.established);
            }
            // Deliver one record at a time, shuffled, then a full
            // round in a shuffled order of its own.
            for record in records {
                topology.apply_update(vec![record]).unwrap();
            }
            let mut full = all;
            rng.shuffle(&mut full);
            topology.apply_update(full).unwrap();

            let mut lhs: Vec<&Peer> = topology.peers().collect();
            let mut rhs: Vec<&Peer> = reference.peers().collect();
            lhs.sort_by_key(|p| p.name);
            rhs.sort_by_key(|p| p.name);
            // The local version counters differ (they count local
            // mutations), so compare the rest.
            lhs.iter().zip(rhs.iter()).all(|(a, b)| {
                a.name == b.name && a.uid == b.uid && a.connections == b.connections
            })
        }

        /// Following next hops from the local peer always reaches the
        /// destination without cycles.
        fn prop_routes_converge(graph: Graph) -> bool {
            let topology = mesh(1, &graph.edges);
            let routes = Routes::compute(&topology);

            routes.unicast().keys().all(|dst| {
                let mut here = name(1);
                let mut steps = 0;
                loop {
                    // Each peer on the path routes with its own table.
                    let view = mesh(here.as_u64(), &graph.edges);
                    let table = Routes::compute(&view);
                    match table.next_hop(dst) {
                        None => return false,
                        Some(hop) => {
                            if hop == *dst {
                                return true;
                            }
                            here = hop;
                        }
                    }
                    steps += 1;
                    if steps > graph.edges.len() + 8 {
                        return false;
                    }
                }
            })
        }
    }
}
