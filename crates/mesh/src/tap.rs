//! The boundary to the local capture/inject device.
//!
//! The host driver owns the actual bridge and veth plumbing; the
//! router core only ever sees this trait.

use std::io;

use flume as chan;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A local L2 device frames can be injected into. Captured frames
/// travel the other way through [`Handle::capture`].
///
/// [`Handle::capture`]: crate::client::handle::Handle::capture
pub trait TapDevice: Send {
    fn inject(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Drains the forwarder's inject queue into the device.
pub async fn pump<T: TapDevice>(
    mut device: T,
    inject: chan::Receiver<Vec<u8>>,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            frame = inject.recv_async() => match frame {
                Ok(frame) => {
                    if let Err(err) = device.inject(&frame) {
                        trace!(target: "mesh", "Inject failed: {}", err);
                    }
                }
                Err(_) => return,
            }
        }
    }
}

/// In-memory device for tests: injected frames are collected on a
/// channel.
#[derive(Debug, Clone)]
pub struct MemoryTap {
    frames: chan::Sender<Vec<u8>>,
}

impl MemoryTap {
    pub fn new() -> (Self, chan::Receiver<Vec<u8>>) {
        let (tx, rx) = chan::unbounded();
        (Self { frames: tx }, rx)
    }
}

impl TapDevice for MemoryTap {
    fn inject(&mut self, frame: &[u8]) -> io::Result<()> {
        self.frames
            .send(frame.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}
