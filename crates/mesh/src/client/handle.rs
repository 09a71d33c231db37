//! Handles are created from a running client to communicate with the
//! router from other threads and tasks.

use std::net::SocketAddr;

use async_trait::async_trait;
use flume as chan;
use thiserror::Error;

use weave_types::PeerName;

use crate::fsm::gossipmgr::GossipEvent;
use crate::fsm::handler::{Command, PeerView, StatusReport};

/// Queue size for gossip deliveries to a channel actor.
pub const CHANNEL_QUEUE_SIZE: usize = 256;

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// The command returned an error.
    #[error("command failed")]
    Command,
    /// The operation timed out.
    #[error("the operation timed out")]
    Timeout,
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with the router.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Send a raw command to the router.
    async fn command(&self, cmd: Command) -> Result<(), Error>;

    /// Add a connection target.
    async fn connect(&self, addr: SocketAddr) -> Result<(), Error>;

    /// Remove a connection target.
    async fn forget(&self, addr: SocketAddr) -> Result<(), Error>;

    /// Fetch a status snapshot.
    async fn status(&self) -> Result<StatusReport, Error>;

    /// Fetch the current peer list.
    async fn peers(&self) -> Result<Vec<PeerView>, Error>;

    /// Register a gossip channel, returning its delivery queue.
    async fn register_channel(&self, name: &str) -> Result<chan::Receiver<GossipEvent>, Error>;

    /// Broadcast mergeable state on a channel.
    async fn gossip_broadcast(&self, channel: &str, payload: Vec<u8>) -> Result<(), Error>;

    /// Send state to one peer on a channel.
    async fn gossip_unicast(
        &self,
        channel: &str,
        dst: PeerName,
        payload: Vec<u8>,
    ) -> Result<(), Error>;

    /// Exchange full state with all neighbours on a channel.
    async fn gossip(&self, channel: &str, payload: Vec<u8>) -> Result<(), Error>;

    /// Feed a captured Ethernet frame into the forwarder.
    async fn capture(&self, frame: Vec<u8>) -> Result<(), Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn command(&self, cmd: Command) -> Result<(), Error>;
        async fn connect(&self, addr: SocketAddr) -> Result<(), Error>;
        async fn forget(&self, addr: SocketAddr) -> Result<(), Error>;
        async fn status(&self) -> Result<StatusReport, Error>;
        async fn peers(&self) -> Result<Vec<PeerView>, Error>;
        async fn register_channel(&self, name: &str) -> Result<chan::Receiver<GossipEvent>, Error>;
        async fn gossip_broadcast(&self, channel: &str, payload: Vec<u8>) -> Result<(), Error>;
        async fn gossip_unicast(
            &self,
            channel: &str,
            dst: PeerName,
            payload: Vec<u8>,
        ) -> Result<(), Error>;
        async fn gossip(&self, channel: &str, payload: Vec<u8>) -> Result<(), Error>;
        async fn capture(&self, frame: Vec<u8>) -> Result<(), Error>;
    }
}
