use std::io;

use thiserror::Error;

/// An error occuring in the reactor.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("the channel to the user thread is disconnected")]
    Channel,
}
