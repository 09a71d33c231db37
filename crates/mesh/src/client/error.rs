use std::io;

use thiserror::Error;

/// An error starting the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
}
