//! Generic epidemic dissemination over the mesh.
//!
//! Gossip is organized in named channels. The topology channel is
//! handled inside the state machine; any other channel is registered
//! with a delivery queue and served to its owning actor. Three
//! primitives exist per channel: spanning-tree broadcast, routed
//! unicast, and neighbour full-state exchange (the periodic
//! anti-entropy round).

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use flume as chan;
use tracing::{debug, trace};

use weave_types::message::ChannelId;
use weave_types::PeerName;

use super::output::Wire;
use super::topology::Routes;

/// Interval of the periodic full-state fan-out.
pub const GOSSIP_INTERVAL: crate::net::LocalDuration = crate::net::LocalDuration::from_secs(30);

/// Established peers by name with their connection addresses, rebuilt
/// by the handler per operation.
pub type GossipNeighbors = BTreeMap<PeerName, SocketAddr>;

/// Received gossip delivered to a channel's owning actor.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    /// Mergeable state received via broadcast or the periodic
    /// exchange.
    Broadcast { src: PeerName, payload: Vec<u8> },
    /// A message addressed specifically to this peer.
    Unicast { src: PeerName, payload: Vec<u8> },
}

#[derive(Debug)]
struct Channel {
    name: String,
    delivery: chan::Sender<GossipEvent>,
}

/// Routes gossip messages between the wire and channel actors.
#[derive(Debug)]
pub struct GossipManager<U> {
    local: PeerName,
    channels: HashMap<ChannelId, Channel>,
    /// Events dropped because a channel actor couldn't keep up. The
    /// next periodic round recovers the state.
    dropped: u64,
    upstream: U,
}

impl<U: Wire<super::event::Event>> GossipManager<U> {
    pub fn new(local: PeerName, upstream: U) -> Self {
        Self {
            local,
            channels: HashMap::new(),
            dropped: 0,
            upstream,
        }
    }

    /// Register a channel by name. Returns its wire id.
    pub fn register(&mut self, name: &str, delivery: chan::Sender<GossipEvent>) -> ChannelId {
        let id = ChannelId::of(name);
        debug!(target: "mesh", "Registered gossip channel `{}` ({})", name, id);

        self.channels.insert(
            id,
            Channel {
                name: name.to_owned(),
                delivery,
            },
        );
        id
    }

    pub fn channel_name(&self, id: &ChannelId) -> Option<&str> {
        self.channels.get(id).map(|c| c.name.as_str())
    }

    /// Deliver an event to a channel actor without ever blocking the
    /// packet path.
    fn deliver(&mut self, id: &ChannelId, event: GossipEvent) {
        let Some(channel) = self.channels.get(id) else {
            trace!(target: "mesh", "Gossip for unknown channel {}, dropping", id);
            return;
        };
        if channel.delivery.try_send(event).is_err() {
            self.dropped += 1;
        }
    }

    /// A periodic full-state exchange arrived from a neighbour.
    pub fn received_gossip(&mut self, id: &ChannelId, from: PeerName, payload: Vec<u8>) {
        self.deliver(id, GossipEvent::Broadcast { src: from, payload });
    }

    /// A broadcast arrived; deliver it and relay it down our subtree.
    pub fn received_broadcast(
        &mut self,
        id: &ChannelId,
        src: PeerName,
        payload: Vec<u8>,
        routes: &Routes,
        neighbors: &GossipNeighbors,
    ) {
        self.deliver(
            id,
            GossipEvent::Broadcast {
                src,
                payload: payload.clone(),
            },
        );
        self.relay_broadcast(id, src, payload, routes, neighbors);
    }

    /// Relay a broadcast along the spanning tree rooted at its
    /// source.
    pub fn relay_broadcast(
        &mut self,
        id: &ChannelId,
        src: PeerName,
        payload: Vec<u8>,
        routes: &Routes,
        neighbors: &GossipNeighbors,
    ) {
        for child in routes.broadcast_children(&src) {
            if let Some(addr) = neighbors.get(child) {
                self.upstream
                    .gossip_broadcast(*addr, *id, src, payload.clone());
            }
        }
    }

    /// A unicast arrived; deliver it if it is ours, otherwise relay
    /// it towards its destination.
    pub fn received_unicast(
        &mut self,
        id: &ChannelId,
        src: PeerName,
        dst: PeerName,
        payload: Vec<u8>,
        routes: &Routes,
        neighbors: &GossipNeighbors,
    ) {
        if dst == self.local {
            self.deliver(id, GossipEvent::Unicast { src, payload });
        } else {
            self.forward_unicast(id, src, dst, payload, routes, neighbors);
        }
    }

    /// Originate a broadcast on a channel.
    pub fn broadcast(
        &mut self,
        id: &ChannelId,
        payload: Vec<u8>,
        routes: &Routes,
        neighbors: &GossipNeighbors,
    ) {
        let local = self.local;
        self.relay_broadcast(id, local, payload, routes, neighbors);
    }

    /// Originate (or relay) a unicast towards `dst`. Returns `false`
    /// if no route exists; the message is dropped.
    pub fn forward_unicast(
        &mut self,
        id: &ChannelId,
        src: PeerName,
        dst: PeerName,
        payload: Vec<u8>,
        routes: &Routes,
        neighbors: &GossipNeighbors,
    ) -> bool {
        let hop = if neighbors.contains_key(&dst) {
            Some(dst)
        } else {
            routes.next_hop(&dst)
        };
        let addr = hop.and_then(|hop| neighbors.get(&hop));

        match addr {
            Some(addr) => {
                self.upstream.gossip_unicast(*addr, *id, src, dst, payload);
                true
            }
            None => {
                trace!(target: "mesh", "No route for gossip unicast to {}, dropping", dst);
                false
            }
        }
    }

    /// Send a full-state exchange to every established neighbour.
    pub fn gossip_neighbors(
        &mut self,
        id: &ChannelId,
        payload: Vec<u8>,
        neighbors: &GossipNeighbors,
    ) {
        for addr in neighbors.values() {
            self.upstream.gossip(*addr, *id, payload.clone());
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::{Io, Outbox, WireMsg};
    use crate::fsm::topology::Topology;
    use weave_types::message::Message;
    use weave_types::{ConnectionSummary, Peer, PeerUid};

    fn name(n: u64) -> PeerName {
        PeerName::new(n)
    }

    /// Line topology 1 - 2 - 3 as seen from peer 2.
    fn line_from_middle() -> (Routes, GossipNeighbors) {
        let mut topology = Topology::new(name(2), "middle", PeerUid(2));
        topology.record_connection(name(1), None, true);
        topology.record_connection(name(3), None, true);

        for (n, edge) in [(1u64, 2u64), (3, 2)] {
            let mut peer = Peer::new(name(n), format!("peer-{n}"), PeerUid(n));
            peer.version = 1;
            peer.connections.insert(
                name(edge),
                ConnectionSummary {
                    addr: None,
                    established: true,
                },
            );
            topology.apply_update(vec![peer]).unwrap();
        }

        let routes = Routes::compute(&topology);
        let mut neighbors = GossipNeighbors::new();
        neighbors.insert(name(1), ([10, 0, 0, 1], 6783).into());
        neighbors.insert(name(3), ([10, 0, 0, 3], 6783).into());
        (routes, neighbors)
    }

    #[test]
    fn broadcasts_relay_down_the_tree() {
        let (routes, neighbors) = line_from_middle();
        let mut outbox = Outbox::new();
        let mut mgr = GossipManager::new(name(2), outbox.clone());

        let (tx, rx) = chan::bounded(4);
        let id = mgr.register("IPallocation", tx);

        // A broadcast from peer 1 reaches us; we must deliver it and
        // relay it to peer 3, our only tree child for source 1.
        mgr.received_broadcast(&id, name(1), vec![7], &routes, &neighbors);

        assert!(matches!(
            rx.try_recv().unwrap(),
            GossipEvent::Broadcast { src, .. } if src == name(1)
        ));

        let relayed: Vec<_> = outbox
            .by_ref()
            .filter_map(|io| match io {
                Io::Write(addr, WireMsg::Message(Message::GossipBroadcast { src, .. })) => {
                    Some((addr, src))
                }
                _ => None,
            })
            .collect();
        assert_eq!(relayed, vec![(([10, 0, 0, 3], 6783).into(), name(1))]);
    }

    #[test]
    fn unicasts_route_through_the_middle() {
        let (routes, neighbors) = line_from_middle();
        let mut outbox = Outbox::new();
        let mut mgr = GossipManager::new(name(2), outbox.clone());

        let (tx, _rx) = chan::bounded(4);
        let id = mgr.register("IPallocation", tx);

        // Peer 1 sends to peer 3 through us.
        mgr.received_unicast(&id, name(1), name(3), vec![9], &routes, &neighbors);

        let forwarded = outbox.by_ref().any(|io| {
            matches!(
                io,
                Io::Write(addr, WireMsg::Message(Message::GossipUnicast { dst, .. }))
                    if dst == name(3) && addr == ([10, 0, 0, 3], 6783).into()
            )
        });
        assert!(forwarded);
    }

    #[test]
    fn unicast_for_us_is_delivered() {
        let (routes, neighbors) = line_from_middle();
        let mut mgr = GossipManager::new(name(2), Outbox::new());

        let (tx, rx) = chan::bounded(4);
        let id = mgr.register("IPallocation", tx);

        mgr.received_unicast(&id, name(1), name(2), vec![5], &routes, &neighbors);
        assert!(matches!(
            rx.try_recv().unwrap(),
            GossipEvent::Unicast { src, payload } if src == name(1) && payload == vec![5]
        ));
    }

    #[test]
    fn unroutable_unicast_is_dropped() {
        let (routes, neighbors) = line_from_middle();
        let mut mgr = GossipManager::new(name(2), Outbox::new());

        let (tx, _rx) = chan::bounded(4);
        let id = mgr.register("IPallocation", tx);

        assert!(!mgr.forward_unicast(&id, name(2), name(9), vec![], &routes, &neighbors));
    }

    #[test]
    fn full_channel_counts_drops() {
        let (routes, neighbors) = line_from_middle();
        let mut mgr = GossipManager::new(name(2), Outbox::new());

        let (tx, _rx) = chan::bounded(1);
        let id = mgr.register("IPallocation", tx);

        mgr.received_broadcast(&id, name(1), vec![1], &routes, &neighbors);
        mgr.received_broadcast(&id, name(1), vec![2], &routes, &neighbors);
        assert_eq!(mgr.dropped(), 1);
    }
}
