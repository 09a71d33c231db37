//! The async runner around the reactor and state machine.

use std::net::SocketAddr;
use std::{net, time};

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

use weave_types::{PeerName, PeerUid};

use crate::client::error::Error;
use crate::client::handle;
use crate::client::service::Service;
use crate::fsm::gossipmgr::GossipEvent;
use crate::fsm::handler::{self, Command, PeerView, StatusReport};
use crate::fsm::peermgr::DEFAULT_CONN_LIMIT;
use crate::net::time::RefClock;
use crate::net::{LocalTime, NetReactor, NetWaker};

/// Frames waiting for injection into the local device. Overflow drops
/// frames rather than stall the forwarder.
const INJECT_QUEUE_SIZE: usize = 1024;

/// Router client configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Our stable name, derived from an interface MAC by the host.
    pub name: PeerName,
    /// Human-friendly nickname.
    pub nick_name: String,
    /// Listen address; TCP and UDP both bind it.
    pub listen: SocketAddr,
    /// Cluster password.
    pub password: Option<String>,
    /// Initial connection targets.
    pub peers: Vec<SocketAddr>,
    /// Cap on concurrent connections.
    pub conn_limit: usize,
}

impl MeshConfig {
    pub fn new(
        name: PeerName,
        nick_name: impl Into<String>,
        listen: SocketAddr,
        peers: Vec<net::SocketAddr>,
    ) -> Self {
        Self {
            name,
            nick_name: nick_name.into(),
            listen,
            password: None,
            peers,
            conn_limit: DEFAULT_CONN_LIMIT,
        }
    }
}

/// Runs a pre-loaded router client.
pub struct MeshClient<R: NetReactor> {
    handle: Handle<R::Waker>,
    service: Service,
    listen: SocketAddr,
    commands: chan::Receiver<Command>,
    reactor: R,
    inject: chan::Receiver<Vec<u8>>,
}

impl<R: NetReactor> MeshClient<R> {
    /// Create a new client.
    pub fn new(config: MeshConfig) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let (listening_tx, listening_rx) = chan::bounded(1);
        let (inject_tx, inject_rx) = chan::bounded(INJECT_QUEUE_SIZE);

        let reactor = R::new(listening_tx)?;

        let mut rng = fastrand::Rng::new();
        let uid = PeerUid(rng.u64(1..));
        let clock = RefClock::from(LocalTime::now());

        let machine = handler::StateMachine::new(
            handler::Config {
                name: config.name,
                nick_name: config.nick_name.clone(),
                uid,
                port: config.listen.port(),
                password: config.password.clone(),
                peers: config.peers.clone(),
                conn_limit: config.conn_limit,
            },
            rng,
            clock,
            inject_tx,
            Vec::new(),
        );

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            timeout: time::Duration::from_secs(60),
            listening: listening_rx,
        };

        Ok(MeshClient {
            handle,
            listen: config.listen,
            commands: commands_rx,
            reactor,
            service: Service::new(machine),
            inject: inject_rx,
        })
    }

    /// Run a pre-loaded client.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(&self.listen, self.service, self.commands, cancellation)
            .await;

        if let Err(e) = result {
            tracing::error!("Router is down. Client run error: {}", e);
        }
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> Handle<R::Waker> {
        self.handle.clone()
    }

    /// Frames the forwarder wants injected into the local device.
    pub fn injector(&self) -> chan::Receiver<Vec<u8>> {
        self.inject.clone()
    }
}

#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub commands: chan::Sender<Command>,
    pub waker: W,
    pub timeout: time::Duration,
    pub listening: chan::Receiver<net::SocketAddr>,
}

impl<W: NetWaker> Handle<W> {
    /// Send a command to the command channel, and wake up the event
    /// loop.
    async fn _command(&self, cmd: Command) -> Result<(), handle::Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(handle::Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }

    /// Wait for the reactor to publish the bound listen address.
    pub async fn listening(&self) -> Result<net::SocketAddr, handle::Error> {
        Ok(self.listening.recv_async().await?)
    }
}

#[async_trait]
impl<W: NetWaker> handle::Handle for Handle<W> {
    async fn command(&self, cmd: Command) -> Result<(), handle::Error> {
        self._command(cmd).await
    }

    async fn connect(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self._command(Command::Connect(addr)).await
    }

    async fn forget(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self._command(Command::Forget(addr)).await
    }

    async fn status(&self) -> Result<StatusReport, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self._command(Command::Status(transmit)).await?;

        match receive.recv_async().await {
            Ok(report) => Ok(report),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn peers(&self) -> Result<Vec<PeerView>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self._command(Command::Peers(transmit)).await?;

        match receive.recv_async().await {
            Ok(peers) => Ok(peers),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn register_channel(
        &self,
        name: &str,
    ) -> Result<chan::Receiver<GossipEvent>, handle::Error> {
        let (transmit, receive) = chan::bounded(handle::CHANNEL_QUEUE_SIZE);
        self._command(Command::RegisterChannel(name.to_owned(), transmit))
            .await?;

        Ok(receive)
    }

    async fn gossip_broadcast(&self, channel: &str, payload: Vec<u8>) -> Result<(), handle::Error> {
        self._command(Command::Broadcast(channel.to_owned(), payload))
            .await
    }

    async fn gossip_unicast(
        &self,
        channel: &str,
        dst: PeerName,
        payload: Vec<u8>,
    ) -> Result<(), handle::Error> {
        self._command(Command::Unicast(channel.to_owned(), dst, payload))
            .await
    }

    async fn gossip(&self, channel: &str, payload: Vec<u8>) -> Result<(), handle::Error> {
        self._command(Command::Gossip(channel.to_owned(), payload))
            .await
    }

    async fn capture(&self, frame: Vec<u8>) -> Result<(), handle::Error> {
        self._command(Command::Capture(frame)).await
    }
}
