//! Message stream utilities.

use weave_types::wire::{self, MAX_FRAME_SIZE};

/// Length-prefixed frame decoder.
///
/// Turns a TCP byte stream into message payloads.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
}

impl Decoder {
    /// Create a new stream decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next frame payload. Returns [`None`] if a
    /// full frame isn't buffered yet.
    pub fn decode_next(&mut self) -> Result<Option<Vec<u8>>, wire::Error> {
        if self.unparsed.len() < 4 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes(self.unparsed[..4].try_into().expect("slice is four bytes")) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(wire::Error::OversizedFrame(len));
        }
        if self.unparsed.len() < 4 + len {
            return Ok(None);
        }

        let payload = self.unparsed[4..4 + len].to_vec();
        self.unparsed.drain(..4 + len);
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_inputs() {
        let mut decoder = Decoder::new(64);

        decoder.input(&[0, 0, 0, 3, b'a']);
        assert_eq!(decoder.decode_next().unwrap(), None);

        decoder.input(&[b'b', b'c', 0, 0]);
        assert_eq!(decoder.decode_next().unwrap(), Some(b"abc".to_vec()));
        assert_eq!(decoder.decode_next().unwrap(), None);

        decoder.input(&[0, 1, b'z']);
        assert_eq!(decoder.decode_next().unwrap(), Some(b"z".to_vec()));
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut decoder = Decoder::new(64);
        decoder.input(&(2 * 1024 * 1024u32).to_be_bytes());
        assert!(decoder.decode_next().is_err());
    }
}
