//! Password-authenticated session encryption.
//!
//! Each connection performs an ephemeral X25519 exchange through the
//! plaintext greeting. The session keys are derived from the shared
//! secret *and* the cluster password, so a peer that doesn't know the
//! password derives different keys and fails authentication on the
//! first sealed message.
//!
//! TCP messages use implicit counter nonces (never transmitted, spec'd
//! strictly in-order by the stream). UDP datagrams carry their 8-byte
//! counter in the clear because datagrams may be lost or reordered; a
//! receive window rejects stale counters.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use weave_types::PeerName;

/// Stale datagram counters older than this many positions behind the
/// highest seen are rejected.
const UDP_REPLAY_WINDOW: u64 = 128;

/// Bytes a sealed datagram adds on top of its plaintext: the clear
/// counter plus the authentication tag.
pub const DATAGRAM_OVERHEAD: usize = 8 + 16;

/// Nonce domain markers, so the same directional key never sees the
/// same nonce on both transports.
const TRANSPORT_TCP: u8 = 0;
const TRANSPORT_UDP: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("message failed authentication")]
    Authentication,
    #[error("datagram counter is stale")]
    StaleCounter,
    #[error("sealed payload is truncated")]
    Truncated,
}

/// An ephemeral keypair for one connection attempt.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate from the state machine's rng.
    pub fn generate(rng: &mut fastrand::Rng) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);

        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);

        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").finish_non_exhaustive()
    }
}

/// An established bidirectional session.
pub struct Session {
    seal_cipher: ChaCha20Poly1305,
    open_cipher: ChaCha20Poly1305,
    tcp_seal_counter: u64,
    tcp_open_counter: u64,
    udp_seal_counter: u64,
    udp_open_max: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tcp_seal_counter", &self.tcp_seal_counter)
            .field("tcp_open_counter", &self.tcp_open_counter)
            .field("udp_seal_counter", &self.udp_seal_counter)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Derive the session from our keypair, the remote public key, the
    /// cluster password and the two peer names.
    ///
    /// Both ends derive the same two directional keys; which one each
    /// end seals with is decided by name order, so the derivation is
    /// symmetric in its inputs.
    pub fn new(
        keypair: Keypair,
        their_public: [u8; 32],
        password: &str,
        our_name: PeerName,
        their_name: PeerName,
    ) -> Self {
        let shared = keypair.secret.diffie_hellman(&PublicKey::from(their_public));

        let (low, high) = if our_name <= their_name {
            (our_name, their_name)
        } else {
            (their_name, our_name)
        };
        let info = format!("weave session {} {}", low, high);

        let hkdf = Hkdf::<Sha256>::new(Some(password.as_bytes()), shared.as_bytes());
        let mut okm = [0u8; 64];
        hkdf.expand(info.as_bytes(), &mut okm)
            .expect("64 bytes is a valid hkdf-sha256 output length");

        let low_key = Key::from_slice(&okm[..32]);
        let high_key = Key::from_slice(&okm[32..]);

        let (seal_key, open_key) = if our_name <= their_name {
            (low_key, high_key)
        } else {
            (high_key, low_key)
        };

        Self {
            seal_cipher: ChaCha20Poly1305::new(seal_key),
            open_cipher: ChaCha20Poly1305::new(open_key),
            tcp_seal_counter: 0,
            tcp_open_counter: 0,
            udp_seal_counter: 0,
            udp_open_max: 0,
        }
    }

    fn nonce(transport: u8, counter: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[0] = transport;
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        Nonce::from(bytes)
    }

    /// Seal a TCP message body. The nonce is the implicit send counter.
    pub fn seal_message(&mut self, plain: &[u8]) -> Vec<u8> {
        let nonce = Self::nonce(TRANSPORT_TCP, self.tcp_seal_counter);
        self.tcp_seal_counter += 1;

        self.seal_cipher
            .encrypt(&nonce, plain)
            .expect("chacha20poly1305 encryption is infallible")
    }

    /// Open a TCP message body with the implicit receive counter.
    pub fn open_message(&mut self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = Self::nonce(TRANSPORT_TCP, self.tcp_open_counter);

        let plain = self
            .open_cipher
            .decrypt(&nonce, sealed)
            .map_err(|_| Error::Authentication)?;
        self.tcp_open_counter += 1;

        Ok(plain)
    }

    /// Seal a UDP datagram. The counter rides in the clear so the
    /// receiver can open datagrams out of order.
    pub fn seal_datagram(&mut self, plain: &[u8]) -> Vec<u8> {
        let counter = self.udp_seal_counter;
        self.udp_seal_counter += 1;

        let nonce = Self::nonce(TRANSPORT_UDP, counter);
        let sealed = self
            .seal_cipher
            .encrypt(&nonce, plain)
            .expect("chacha20poly1305 encryption is infallible");

        let mut bytes = Vec::with_capacity(8 + sealed.len());
        bytes.extend_from_slice(&counter.to_be_bytes());
        bytes.extend_from_slice(&sealed);
        bytes
    }

    /// Open a UDP datagram, rejecting counters behind the replay
    /// window.
    pub fn open_datagram(&mut self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        if bytes.len() < 8 {
            return Err(Error::Truncated);
        }
        let counter = u64::from_be_bytes(bytes[..8].try_into().expect("slice is eight bytes"));

        if counter + UDP_REPLAY_WINDOW < self.udp_open_max {
            return Err(Error::StaleCounter);
        }

        let nonce = Self::nonce(TRANSPORT_UDP, counter);
        let plain = self
            .open_cipher
            .decrypt(&nonce, &bytes[8..])
            .map_err(|_| Error::Authentication)?;

        self.udp_open_max = self.udp_open_max.max(counter);
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PeerName {
        s.parse().unwrap()
    }

    fn session_pair(password_a: &str, password_b: &str) -> (Session, Session) {
        let mut rng = fastrand::Rng::with_seed(7);
        let a = Keypair::generate(&mut rng);
        let b = Keypair::generate(&mut rng);
        let (a_pub, b_pub) = (a.public_bytes(), b.public_bytes());

        let alpha = name("00:00:00:00:00:01");
        let beta = name("00:00:00:00:00:02");

        (
            Session::new(a, b_pub, password_a, alpha, beta),
            Session::new(b, a_pub, password_b, beta, alpha),
        )
    }

    #[test]
    fn tcp_roundtrip_both_directions() {
        let (mut a, mut b) = session_pair("sesame", "sesame");

        let sealed = a.seal_message(b"hello");
        assert_eq!(b.open_message(&sealed).unwrap(), b"hello");

        let sealed = b.seal_message(b"goodbye");
        assert_eq!(a.open_message(&sealed).unwrap(), b"goodbye");
    }

    #[test]
    fn tcp_nonces_advance() {
        let (mut a, mut b) = session_pair("sesame", "sesame");

        let first = a.seal_message(b"one");
        let second = a.seal_message(b"two");
        assert_ne!(first, second);

        assert_eq!(b.open_message(&first).unwrap(), b"one");
        assert_eq!(b.open_message(&second).unwrap(), b"two");

        // Replaying the first message desynchronizes the counter.
        assert_eq!(b.open_message(&first), Err(Error::Authentication));
    }

    #[test]
    fn password_mismatch_fails_authentication() {
        let (mut a, mut b) = session_pair("foo", "bar");

        let sealed = a.seal_message(b"hello");
        assert_eq!(b.open_message(&sealed), Err(Error::Authentication));
    }

    #[test]
    fn datagrams_tolerate_reordering() {
        let (mut a, mut b) = session_pair("sesame", "sesame");

        let first = a.seal_datagram(b"one");
        let second = a.seal_datagram(b"two");

        assert_eq!(b.open_datagram(&second).unwrap(), b"two");
        assert_eq!(b.open_datagram(&first).unwrap(), b"one");
    }

    #[test]
    fn stale_datagrams_are_rejected() {
        let (mut a, mut b) = session_pair("sesame", "sesame");

        let old = a.seal_datagram(b"old");
        for _ in 0..UDP_REPLAY_WINDOW + 1 {
            let sealed = a.seal_datagram(b"tick");
            b.open_datagram(&sealed).unwrap();
        }
        assert_eq!(b.open_datagram(&old), Err(Error::StaleCounter));
    }
}
