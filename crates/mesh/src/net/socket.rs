//! Buffered non-blocking stream wrapper used by the reactor.

use std::io;
use std::io::prelude::*;
use std::net;

use crate::net::Link;

/// A peer stream with an outbound write buffer.
///
/// Writes are queued with [`Socket::push`] and drained by
/// [`Socket::flush`] when the underlying descriptor is writable.
#[derive(Debug)]
pub struct Socket<R> {
    raw: R,
    /// Remote peer address.
    pub addr: net::SocketAddr,
    /// Connection direction.
    pub link: Link,
    /// Bytes accepted for sending but not yet written.
    out: Vec<u8>,
}

impl<R: Read + Write> Socket<R> {
    pub fn from(raw: R, addr: net::SocketAddr, link: Link) -> Self {
        Self {
            raw,
            addr,
            link,
            out: Vec::new(),
        }
    }

    /// Queue bytes for sending.
    pub fn push(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }

    /// Write out as much of the queue as the descriptor accepts.
    ///
    /// Returns `WouldBlock` when the queue couldn't be fully drained;
    /// the caller should keep `WRITE` interest set in that case.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.out.is_empty() {
            match self.raw.write(&self.out) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.out.drain(..n);
                }
                Err(err) => return Err(err),
            }
        }
        self.raw.flush()
    }
}

impl Socket<net::TcpStream> {
    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }

    /// Shut the connection down, abandoning any queued output.
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn queued_bytes_are_flushed() {
        let addr = ([127, 0, 0, 1], 6783).into();
        let mut socket = Socket::from(Cursor::new(vec![]), addr, Link::Outbound);

        socket.push(b"hello");
        socket.push(b" world");
        socket.flush().unwrap();

        assert_eq!(socket.raw.into_inner(), b"hello world");
    }
}
