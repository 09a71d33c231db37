//! The allocator actor.
//!
//! Owns the ring and the local claims, and serves allocation requests
//! from its command inbox. Ring state moves between peers on the
//! `IPallocation` gossip channel; space moves by donation in response
//! to unicast space requests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::time::Duration;

use flume as chan;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use weave_mesh::client::handle::Handle as MeshHandle;
use weave_mesh::fsm::gossipmgr::GossipEvent;
use weave_types::PeerName;

use crate::claims::Claims;
use crate::ring::Ring;

/// Gossip channel carrying ring state and space requests.
pub const CHANNEL: &str = "IPallocation";

/// How long to wait for a donation before asking the next candidate.
pub const DONATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer silent for longer than this may be admin-removed.
pub const DEAD_PEER_THRESHOLD: Duration = Duration::from_secs(60);

/// Default deadline for a blocking allocation request.
const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval of the periodic full-state share.
const SHARE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("waiting for a quorum of {0} peers timed out")]
    NoQuorum(usize),
    #[error("no address space could be obtained")]
    RangeExhausted,
    #[error("address {0} is not in a locally owned range")]
    NotOurs(Ipv4Addr),
    #[error("address {0} is already leased")]
    AddressInUse(Ipv4Addr),
    #[error("peer {0} owns nothing here")]
    UnknownPeer(PeerName),
    #[error("peer {0} has gossiped recently; refusing to remove it")]
    PeerStillLive(PeerName),
    #[error("the allocator shut down")]
    Shutdown,
}

/// Compute the quorum needed before the ring may be seeded: from the
/// explicit initial peer count when given, otherwise estimated from
/// the initial peer list.
pub fn quorum(init_peer_count: Option<usize>, initial_peers: usize) -> usize {
    match init_peer_count {
        Some(count) => count / 2 + 1,
        None => (initial_peers + 1) / 2 + 1,
    }
}

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The CIDR under management.
    pub range: Ipv4Net,
    /// Peers that must be visible before the ring is seeded.
    pub quorum: usize,
    /// Deadline for blocking allocation requests.
    pub allocation_timeout: Duration,
    pub donation_timeout: Duration,
    pub dead_peer_threshold: Duration,
    pub share_interval: Duration,
}

impl Config {
    pub fn new(range: Ipv4Net, quorum: usize) -> Self {
        Self {
            range,
            quorum,
            allocation_timeout: ALLOCATION_TIMEOUT,
            donation_timeout: DONATION_TIMEOUT,
            dead_peer_threshold: DEAD_PEER_THRESHOLD,
            share_interval: SHARE_INTERVAL,
        }
    }
}

/// Requests served by the allocator.
pub enum IpamCommand {
    /// Lease any free address for a container. Blocks until the ring
    /// is usable or the deadline passes.
    Allocate {
        container: String,
        reply: chan::Sender<Result<Ipv4Net, Error>>,
    },
    /// Lease one specific address for a container.
    Claim {
        container: String,
        addr: Ipv4Addr,
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Release every lease of a container.
    Free {
        container: String,
        reply: chan::Sender<Result<Vec<Ipv4Addr>, Error>>,
    },
    /// Take over the ranges of a dead peer.
    RemovePeer {
        name: PeerName,
        reply: chan::Sender<Result<(), Error>>,
    },
    /// Snapshot the allocator state.
    Status { reply: chan::Sender<IpamStatus> },
}

/// State messages on the `IPallocation` channel.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpamMessage {
    /// Mergeable ring state plus the sender's free-space summary.
    Update {
        from: PeerName,
        ring: Ring,
        free: u64,
    },
    /// A peer out of space asks us to donate a range.
    SpaceRequest { from: PeerName },
}

/// Allocator state snapshot for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct IpamStatus {
    pub range: Ipv4Net,
    pub quorum: usize,
    pub seeded: bool,
    pub ring: Vec<crate::ring::Token>,
    pub claims: BTreeMap<String, Vec<Ipv4Addr>>,
    pub free: BTreeMap<PeerName, u64>,
    pub pending: usize,
}

struct Pending {
    container: String,
    reply: chan::Sender<Result<Ipv4Net, Error>>,
    deadline: Instant,
    /// Outstanding space request, if any.
    asked: Option<(PeerName, Instant)>,
    /// Candidates that failed to donate in time.
    tried: BTreeSet<PeerName>,
}

/// A handle for talking to a running allocator.
#[derive(Debug, Clone)]
pub struct IpamHandle {
    commands: chan::Sender<IpamCommand>,
}

impl IpamHandle {
    pub async fn allocate(&self, container: &str) -> Result<Ipv4Net, Error> {
        let (reply, receive) = chan::bounded(1);
        self.commands
            .send_async(IpamCommand::Allocate {
                container: container.to_owned(),
                reply,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        receive.recv_async().await.map_err(|_| Error::Shutdown)?
    }

    pub async fn claim(&self, container: &str, addr: Ipv4Addr) -> Result<(), Error> {
        let (reply, receive) = chan::bounded(1);
        self.commands
            .send_async(IpamCommand::Claim {
                container: container.to_owned(),
                addr,
                reply,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        receive.recv_async().await.map_err(|_| Error::Shutdown)?
    }

    pub async fn free(&self, container: &str) -> Result<Vec<Ipv4Addr>, Error> {
        let (reply, receive) = chan::bounded(1);
        self.commands
            .send_async(IpamCommand::Free {
                container: container.to_owned(),
                reply,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        receive.recv_async().await.map_err(|_| Error::Shutdown)?
    }

    pub async fn remove_peer(&self, name: PeerName) -> Result<(), Error> {
        let (reply, receive) = chan::bounded(1);
        self.commands
            .send_async(IpamCommand::RemovePeer { name, reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        receive.recv_async().await.map_err(|_| Error::Shutdown)?
    }

    pub async fn status(&self) -> Result<IpamStatus, Error> {
        let (reply, receive) = chan::bounded(1);
        self.commands
            .send_async(IpamCommand::Status { reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        receive.recv_async().await.map_err(|_| Error::Shutdown)
    }
}

/// The allocator actor. Runs until cancelled.
pub struct Allocator<H> {
    name: PeerName,
    config: Config,
    ring: Ring,
    claims: Claims,
    /// Latest gossiped free-address counts, per peer.
    free_summary: BTreeMap<PeerName, u64>,
    /// When each peer last gossiped on this channel.
    last_heard: HashMap<PeerName, Instant>,
    /// Admin-removed peers; their gossip is ignored until restart.
    tombstones: BTreeSet<PeerName>,
    pending: Vec<Pending>,
    handle: H,
    commands: chan::Receiver<IpamCommand>,
    gossip: chan::Receiver<GossipEvent>,
}

impl<H: MeshHandle> Allocator<H> {
    pub fn new(
        name: PeerName,
        config: Config,
        handle: H,
        gossip: chan::Receiver<GossipEvent>,
    ) -> (Self, IpamHandle) {
        let (commands_tx, commands_rx) = chan::unbounded();

        (
            Self {
                name,
                ring: Ring::new(config.range),
                config,
                claims: Claims::new(),
                free_summary: BTreeMap::new(),
                last_heard: HashMap::new(),
                tombstones: BTreeSet::new(),
                pending: Vec::new(),
                handle,
                commands: commands_rx,
                gossip,
            },
            IpamHandle {
                commands: commands_tx,
            },
        )
    }

    /// Run the allocator. Listens on the command inbox and the gossip
    /// channel, with a coarse tick for deadlines and a slower one for
    /// the periodic state share.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut share = tokio::time::interval(self.config.share_interval);

        loop {
            tokio::select! {
                cmd = self.commands.recv_async() => {
                    let Ok(cmd) = cmd else {
                        trace!(target: "ipam", "All command senders are dropped");
                        return;
                    };
                    self.handle_command(cmd).await;
                }
                event = self.gossip.recv_async() => {
                    let Ok(event) = event else {
                        trace!(target: "ipam", "Gossip channel closed");
                        return;
                    };
                    self.handle_gossip(event).await;
                }
                _ = tick.tick() => self.tick().await,
                _ = share.tick() => self.share(false).await,
                _ = cancellation.cancelled() => {
                    trace!(target: "ipam", "Cancellation received, stopping allocator");
                    return;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: IpamCommand) {
        match cmd {
            IpamCommand::Allocate { container, reply } => {
                self.pending.push(Pending {
                    container,
                    reply,
                    deadline: Instant::now() + self.config.allocation_timeout,
                    asked: None,
                    tried: BTreeSet::new(),
                });
                self.fulfill_pending().await;
                self.request_space().await;
            }
            IpamCommand::Claim {
                container,
                addr,
                reply,
            } => {
                let result = self.claim_specific(&container, addr);
                reply.send_async(result).await.ok();
                self.share(true).await;
            }
            IpamCommand::Free { container, reply } => {
                let freed = self.claims.release(&container);
                debug!(target: "ipam", "Released {} address(es) of {}", freed.len(), container);
                reply.send_async(Ok(freed)).await.ok();
                self.share(true).await;
            }
            IpamCommand::RemovePeer { name, reply } => {
                let result = self.remove_peer(name);
                let removed = result.is_ok();
                reply.send_async(result).await.ok();
                if removed {
                    self.share(true).await;
                    self.fulfill_pending().await;
                }
            }
            IpamCommand::Status { reply } => {
                reply.send_async(self.status()).await.ok();
            }
        }
    }

    fn claim_specific(&mut self, container: &str, addr: Ipv4Addr) -> Result<(), Error> {
        if self.ring.is_empty() {
            return Err(Error::NoQuorum(self.config.quorum));
        }
        if self.ring.owner_of(addr) != Some(self.name) {
            return Err(Error::NotOurs(addr));
        }
        if !self.claims.claim(container, addr) {
            return Err(Error::AddressInUse(addr));
        }
        debug!(target: "ipam", "Claimed {} for {}", addr, container);
        Ok(())
    }

    fn remove_peer(&mut self, name: PeerName) -> Result<(), Error> {
        if !self.ring.owners().contains(&name) {
            return Err(Error::UnknownPeer(name));
        }
        if let Some(heard) = self.last_heard.get(&name) {
            if heard.elapsed() < self.config.dead_peer_threshold {
                return Err(Error::PeerStillLive(name));
            }
        }

        let moved = self.ring.reassign(name, self.name);
        self.tombstones.insert(name);
        self.free_summary.remove(&name);
        self.last_heard.remove(&name);
        warn!(target: "ipam", "Took over {} range(s) of removed peer {}", moved, name);
        Ok(())
    }

    async fn handle_gossip(&mut self, event: GossipEvent) {
        let (src, payload) = match &event {
            GossipEvent::Broadcast { src, payload } | GossipEvent::Unicast { src, payload } => {
                (*src, payload.as_slice())
            }
        };

        let message: IpamMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(target: "ipam", "Undecodable gossip from {}: {}", src, err);
                return;
            }
        };

        match message {
            IpamMessage::Update { from, ring, free } => {
                if self.tombstones.contains(&from) {
                    warn!(target: "ipam", "Ignoring update from removed peer {}", from);
                    return;
                }
                self.last_heard.insert(from, Instant::now());
                self.free_summary.insert(from, free);

                match self.ring.merge(&ring) {
                    Ok(true) => {
                        trace!(target: "ipam", "Merged ring update from {}", from);
                        self.fulfill_pending().await;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(target: "ipam", "Cannot merge ring from {}: {}", from, err);
                    }
                }
            }
            IpamMessage::SpaceRequest { from } => {
                if self.tombstones.contains(&from) {
                    warn!(target: "ipam", "Ignoring space request from removed peer {}", from);
                    return;
                }
                self.last_heard.insert(from, Instant::now());

                let claims = &self.claims;
                if self.ring.donate(self.name, from, |ip| !claims.is_claimed(ip)) {
                    debug!(target: "ipam", "Donated a range to {}", from);
                    self.share(true).await;
                } else {
                    trace!(target: "ipam", "Nothing to donate to {}", from);
                }
            }
        }
    }

    async fn tick(&mut self) {
        self.try_seed().await;
        self.expire_pending().await;
        self.request_space().await;
    }

    /// Bootstrap: once a quorum of peers is visible and no one has
    /// seeded yet, the smallest-named peer claims the whole range.
    async fn try_seed(&mut self) {
        if !self.ring.is_empty() {
            return;
        }
        let Ok(peers) = self.handle.peers().await else {
            return;
        };
        if peers.len() < self.config.quorum {
            return;
        }
        let smallest = peers
            .iter()
            .map(|p| p.name)
            .min()
            .expect("the peer list contains at least ourselves");

        if smallest == self.name {
            debug!(
                target: "ipam",
                "Quorum of {} reached; seeding the ring as the smallest peer",
                self.config.quorum
            );
            self.ring.seed(self.name);
            self.share(true).await;
            self.fulfill_pending().await;
        }
    }

    /// Serve pending allocations from locally owned space.
    async fn fulfill_pending(&mut self) {
        let mut served = false;
        let mut remaining = Vec::new();

        for pending in std::mem::take(&mut self.pending) {
            let claims = &self.claims;
            match self.ring.lowest_free(self.name, |ip| !claims.is_claimed(ip)) {
                Some(ip) => {
                    self.claims.claim(&pending.container, ip);
                    let net = Ipv4Net::new(ip, self.config.range.prefix_len())
                        .expect("an address in the range fits its prefix");
                    debug!(target: "ipam", "Allocated {} to {}", net, pending.container);
                    pending.reply.send_async(Ok(net)).await.ok();
                    served = true;
                }
                None => remaining.push(pending),
            }
        }
        self.pending = remaining;

        if served {
            self.share(true).await;
        }
    }

    /// Fail allocations whose deadline has passed.
    async fn expire_pending(&mut self) {
        let now = Instant::now();
        let quorum = self.config.quorum;
        let seeded = !self.ring.is_empty();

        let mut remaining = Vec::new();
        for pending in std::mem::take(&mut self.pending) {
            if now >= pending.deadline {
                let err = if seeded {
                    Error::RangeExhausted
                } else {
                    Error::NoQuorum(quorum)
                };
                pending.reply.send_async(Err(err)).await.ok();
            } else {
                remaining.push(pending);
            }
        }
        self.pending = remaining;
    }

    /// Ask the most promising peer for space, for any pending
    /// allocation that isn't already waiting on a donation.
    async fn request_space(&mut self) {
        if self.ring.is_empty() {
            return;
        }
        let now = Instant::now();

        for i in 0..self.pending.len() {
            let expired = match self.pending[i].asked {
                None => true,
                Some((_, at)) => now.duration_since(at) >= self.config.donation_timeout,
            };
            if !expired {
                continue;
            }
            if let Some((peer, _)) = self.pending[i].asked.take() {
                self.pending[i].tried.insert(peer);
            }

            let tried = self.pending[i].tried.clone();
            let candidate = self
                .free_summary
                .iter()
                .filter(|(peer, free)| {
                    **peer != self.name
                        && **free > 0
                        && !tried.contains(peer)
                        && !self.tombstones.contains(peer)
                })
                .max_by_key(|(_, free)| **free)
                .map(|(peer, _)| *peer);

            let Some(candidate) = candidate else { continue };

            debug!(target: "ipam", "Requesting space from {}", candidate);
            let message = serde_json::to_vec(&IpamMessage::SpaceRequest { from: self.name })
                .expect("space requests serialize");
            if self
                .handle
                .gossip_unicast(CHANNEL, candidate, message)
                .await
                .is_ok()
            {
                self.pending[i].asked = Some((candidate, now));
            }
        }
    }

    fn free_count(&self) -> u64 {
        self.ring
            .owned_count(self.name)
            .saturating_sub(self.claims.len() as u64)
    }

    /// Share our ring and free count. Deltas go down the broadcast
    /// tree; the periodic round exchanges with direct neighbours.
    async fn share(&mut self, broadcast: bool) {
        if self.ring.is_empty() {
            return;
        }
        let free = self.free_count();
        self.free_summary.insert(self.name, free);

        let message = serde_json::to_vec(&IpamMessage::Update {
            from: self.name,
            ring: self.ring.clone(),
            free,
        })
        .expect("ring updates serialize");

        let result = if broadcast {
            self.handle.gossip_broadcast(CHANNEL, message).await
        } else {
            self.handle.gossip(CHANNEL, message).await
        };
        if result.is_err() {
            trace!(target: "ipam", "Router is gone; cannot share ring state");
        }
    }

    fn status(&self) -> IpamStatus {
        IpamStatus {
            range: self.config.range,
            quorum: self.config.quorum,
            seeded: !self.ring.is_empty(),
            ring: self.ring.tokens().to_vec(),
            claims: self
                .claims
                .containers()
                .map(|(container, addrs)| {
                    (container.clone(), addrs.iter().cloned().collect())
                })
                .collect(),
            free: self.free_summary.clone(),
            pending: self.pending.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_mesh::client::handle::MockHandle;
    use weave_mesh::fsm::handler::{EdgeView, PeerView};

    fn name(n: u64) -> PeerName {
        PeerName::new(n)
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn peer_view(n: u64) -> PeerView {
        PeerView {
            name: name(n),
            nick_name: format!("node-{n}"),
            uid: format!("{n}"),
            version: 1,
            connections: Vec::<EdgeView>::new(),
        }
    }

    /// A mesh handle that records outgoing gossip and serves a fixed
    /// peer list.
    fn mesh_stub(
        peers: Vec<u64>,
    ) -> (MockHandle, chan::Receiver<(String, Option<PeerName>, Vec<u8>)>) {
        let (tx, rx) = chan::unbounded();

        let mut handle = MockHandle::new();
        let peers_tx = peers.clone();
        handle
            .expect_peers()
            .returning(move || Ok(peers_tx.iter().map(|n| peer_view(*n)).collect()));

        let tx_b = tx.clone();
        handle
            .expect_gossip_broadcast()
            .returning(move |channel, payload| {
                tx_b.send((channel.to_owned(), None, payload)).unwrap();
                Ok(())
            });
        let tx_g = tx.clone();
        handle.expect_gossip().returning(move |channel, payload| {
            tx_g.send((channel.to_owned(), None, payload)).unwrap();
            Ok(())
        });
        let tx_u = tx;
        handle
            .expect_gossip_unicast()
            .returning(move |channel, dst, payload| {
                tx_u.send((channel.to_owned(), Some(dst), payload)).unwrap();
                Ok(())
            });

        (handle, rx)
    }

    fn spawn_allocator(
        n: u64,
        quorum_size: usize,
        peers: Vec<u64>,
    ) -> (
        IpamHandle,
        chan::Sender<GossipEvent>,
        chan::Receiver<(String, Option<PeerName>, Vec<u8>)>,
        CancellationToken,
    ) {
        let (handle, sent) = mesh_stub(peers);
        let (gossip_tx, gossip_rx) = chan::unbounded();
        let (allocator, ipam) = Allocator::new(
            name(n),
            Config::new(net("10.2.0.0/16"), quorum_size),
            handle,
            gossip_rx,
        );
        let cancellation = CancellationToken::new();
        tokio::spawn(allocator.run(cancellation.clone()));
        (ipam, gossip_tx, sent, cancellation)
    }

    #[tokio::test(start_paused = true)]
    async fn smallest_peer_seeds_and_allocates() {
        let (ipam, _gossip, _sent, _cancel) = spawn_allocator(1, 2, vec![1, 2]);

        let allocated = ipam.allocate("web").await.unwrap();
        assert_eq!(allocated, net("10.2.0.1/16"));

        // The next allocation gets the next address.
        let second = ipam.allocate("db").await.unwrap();
        assert_eq!(second, net("10.2.0.2/16"));

        let status = ipam.status().await.unwrap();
        assert!(status.seeded);
        assert_eq!(status.claims.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn allocation_blocks_until_quorum() {
        // Quorum of 2 but only ourselves visible: allocation times
        // out with a quorum error.
        let (ipam, _gossip, _sent, _cancel) = spawn_allocator(1, 2, vec![1]);

        let err = ipam.allocate("web").await.unwrap_err();
        assert_eq!(err, Error::NoQuorum(2));
    }

    #[tokio::test(start_paused = true)]
    async fn larger_named_peer_waits_for_the_seeder() {
        // We are peer 2; peer 1 is smaller and must seed. Deliver its
        // seeded ring through gossip and watch the allocation complete
        // with a donated range.
        let (ipam, gossip, sent, _cancel) = spawn_allocator(2, 2, vec![1, 2]);

        let allocation = tokio::spawn(async move { ipam.allocate("web").await });

        // Peer 1's seeded ring arrives.
        let mut ring = Ring::new(net("10.2.0.0/16"));
        ring.seed(name(1));
        let update = serde_json::to_vec(&IpamMessage::Update {
            from: name(1),
            ring: ring.clone(),
            free: 65_534,
        })
        .unwrap();
        gossip
            .send_async(GossipEvent::Broadcast {
                src: name(1),
                payload: update,
            })
            .await
            .unwrap();

        // The allocator asks peer 1 for space.
        let (channel, dst, _payload) = sent.recv_async().await.unwrap();
        assert_eq!(channel, CHANNEL);
        assert_eq!(dst, Some(name(1)));

        // Peer 1 donates: its merged ring now shows us owning the top
        // half.
        ring.donate(name(1), name(2), |_| true);
        let update = serde_json::to_vec(&IpamMessage::Update {
            from: name(1),
            ring,
            free: 32_767,
        })
        .unwrap();
        gossip
            .send_async(GossipEvent::Broadcast {
                src: name(1),
                payload: update,
            })
            .await
            .unwrap();

        let allocated = allocation.await.unwrap().unwrap();
        assert_eq!(allocated, net("10.2.128.0/16"));
    }

    #[tokio::test(start_paused = true)]
    async fn donation_is_served_from_free_space() {
        let (ipam, gossip, sent, _cancel) = spawn_allocator(1, 1, vec![1]);

        // Seed (we are alone and smallest), then lease one address.
        let first = ipam.allocate("web").await.unwrap();
        assert_eq!(first.addr(), "10.2.0.1".parse::<Ipv4Addr>().unwrap());
        while sent.try_recv().is_ok() {}

        // A space request from peer 2 triggers a donation.
        let request = serde_json::to_vec(&IpamMessage::SpaceRequest { from: name(2) }).unwrap();
        gossip
            .send_async(GossipEvent::Unicast {
                src: name(2),
                payload: request,
            })
            .await
            .unwrap();

        // The shared ring shows peer 2 as an owner.
        let (_, _, payload) = sent.recv_async().await.unwrap();
        let IpamMessage::Update { ring, .. } = serde_json::from_slice(&payload).unwrap() else {
            panic!("expected a ring update");
        };
        assert!(ring.owners().contains(&name(2)));

        let status = ipam.status().await.unwrap();
        assert!(status.seeded);
        // Our claim stayed with us.
        assert!(status.claims.contains_key("web"));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_peers_are_removed_only_after_the_threshold() {
        let (ipam, gossip, _sent, _cancel) = spawn_allocator(1, 1, vec![1]);

        // Seed and donate to peer 2 so it owns space.
        ipam.allocate("seed-trigger").await.unwrap();
        let request = serde_json::to_vec(&IpamMessage::SpaceRequest { from: name(2) }).unwrap();
        gossip
            .send_async(GossipEvent::Unicast {
                src: name(2),
                payload: request,
            })
            .await
            .unwrap();
        // Let the donation land before poking at the ring.
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Freshly heard from: refused.
        let err = ipam.remove_peer(name(2)).await.unwrap_err();
        assert_eq!(err, Error::PeerStillLive(name(2)));

        // After the dead-peer threshold, removal succeeds and we own
        // everything again.
        tokio::time::sleep(DEAD_PEER_THRESHOLD + Duration::from_secs(1)).await;
        ipam.remove_peer(name(2)).await.unwrap();

        let status = ipam.status().await.unwrap();
        let owners: Vec<PeerName> = status.ring.iter().map(|t| t.owner).collect();
        assert!(owners.iter().all(|o| *o == name(1)));

        // A removed peer is refused on sight.
        let err = ipam.remove_peer(name(2)).await.unwrap_err();
        assert_eq!(err, Error::UnknownPeer(name(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn specific_claims_respect_ownership() {
        let (ipam, gossip, _sent, _cancel) = spawn_allocator(1, 1, vec![1]);
        ipam.allocate("seed-trigger").await.unwrap();

        // Donate the top half away; claiming from it must fail.
        let request = serde_json::to_vec(&IpamMessage::SpaceRequest { from: name(2) }).unwrap();
        gossip
            .send_async(GossipEvent::Unicast {
                src: name(2),
                payload: request,
            })
            .await
            .unwrap();
        // Wait until the donation has been processed.
        tokio::time::sleep(Duration::from_secs(1)).await;

        ipam.claim("svc", "10.2.0.9".parse().unwrap()).await.unwrap();
        assert_eq!(
            ipam.claim("svc2", "10.2.200.1".parse().unwrap())
                .await
                .unwrap_err(),
            Error::NotOurs("10.2.200.1".parse().unwrap())
        );
        assert_eq!(
            ipam.claim("svc3", "10.2.0.9".parse().unwrap())
                .await
                .unwrap_err(),
            Error::AddressInUse("10.2.0.9".parse().unwrap())
        );

        // Freeing makes the address reusable immediately.
        ipam.free("svc").await.unwrap();
        ipam.claim("svc4", "10.2.0.9".parse().unwrap()).await.unwrap();
    }
}
