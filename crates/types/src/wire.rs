//! Binary wire encoding.
//!
//! Every value on the wire is written through [`Encodable`] and read
//! back through [`Decodable`]. Integers are big-endian; variable-size
//! payloads carry a `u32` length. TCP messages are framed as a `u32`
//! length followed by the tagged message body, capped at
//! [`MAX_FRAME_SIZE`].

use std::io;

use thiserror::Error;

/// Largest admissible framed message.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    OversizedFrame(usize),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("invalid peer name `{0}`")]
    InvalidPeerName(String),
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("protocol tag or version mismatch")]
    ProtocolMismatch,
}

impl Error {
    /// Whether more input could turn this error into a success.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

pub trait Encodable {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error>;
}

pub trait Decodable: Sized {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, Error>;
}

macro_rules! impl_int {
    ($ty:ty) => {
        impl Encodable for $ty {
            fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
                let bytes = self.to_be_bytes();
                w.write_all(&bytes)?;
                Ok(bytes.len())
            }
        }

        impl Decodable for $ty {
            fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                r.read_exact(&mut bytes)?;
                Ok(<$ty>::from_be_bytes(bytes))
            }
        }
    };
}

impl_int!(u8);
impl_int!(u16);
impl_int!(u32);
impl_int!(u64);

impl Encodable for [u8] {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = (self.len() as u32).encode(w)?;
        w.write_all(self)?;
        len += self.len();
        Ok(len)
    }
}

impl Encodable for Vec<u8> {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.as_slice().encode(w)
    }
}

impl Decodable for Vec<u8> {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let len = u32::decode(r)? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::OversizedFrame(len));
        }
        let mut bytes = vec![0u8; len];
        r.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

impl Encodable for str {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.as_bytes().encode(w)
    }
}

impl Encodable for String {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(w)
    }
}

impl Decodable for String {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let bytes = Vec::<u8>::decode(r)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }
}

/// Encode a value into a fresh buffer.
pub fn encode_to_vec<T: Encodable + ?Sized>(value: &T) -> Result<Vec<u8>, io::Error> {
    let mut buf = Vec::new();
    value.encode(&mut buf)?;
    Ok(buf)
}

/// Wrap an already-encoded message body in the length-prefixed frame.
pub fn frame(body: &[u8]) -> Result<Vec<u8>, Error> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::OversizedFrame(body.len()));
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    (body.len() as u32)
        .encode(&mut buf)
        .expect("writing to an in-memory buffer doesn't fail");
    buf.extend_from_slice(body);
    Ok(buf)
}
