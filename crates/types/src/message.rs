//! Messages exchanged between peers.
//!
//! TCP carries length-prefixed tagged messages ([`Message`]); UDP
//! carries self-delimited datagrams ([`Datagram`]) for data frames and
//! liveness probes.

use std::io;

use bitcoin_hashes::siphash24;

use crate::peer::{PeerName, PeerUid};
use crate::wire::{self, Decodable, Encodable};
use crate::{PROTOCOL_TAG, PROTOCOL_VERSION};

/// Keys for the channel-name hash. Fixed so every peer maps a channel
/// name to the same id.
const CHANNEL_HASH_KEYS: (u64, u64) = (0x77656176652d6d73, 0x68_6173682d6b6579);

/// Identifier of a gossip channel: an 8-byte hash of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn of(name: &str) -> Self {
        Self(siphash24::Hash::hash_with_keys(CHANNEL_HASH_KEYS.0, CHANNEL_HASH_KEYS.1, name.as_bytes()).as_u64())
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Encodable for ChannelId {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.encode(w)
    }
}

impl Decodable for ChannelId {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        Ok(Self(u64::decode(r)?))
    }
}

/// A tagged message on an established TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness probe. Normally travels over UDP; the TCP form exists
    /// for symmetry of the tag space.
    Heartbeat,
    /// Acknowledges that the sender has received the remote's UDP
    /// heartbeats: the remote's UDP path works.
    ConnectionEstablished,
    /// PMTU probe acknowledgement request, padded on the UDP side.
    FragmentationTest,
    /// Acknowledges receipt of a [`Message::FragmentationTest`] of the
    /// given size.
    PmtuVerified(u16),
    /// Channel gossip addressed to a single peer, relayed hop-by-hop.
    GossipUnicast {
        channel: ChannelId,
        src: PeerName,
        dst: PeerName,
        payload: Vec<u8>,
    },
    /// Channel gossip relayed along the broadcast tree rooted at `src`.
    GossipBroadcast {
        channel: ChannelId,
        src: PeerName,
        payload: Vec<u8>,
    },
    /// Periodic neighbour-to-neighbour full-state exchange.
    Gossip { channel: ChannelId, payload: Vec<u8> },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Heartbeat => 1,
            Message::ConnectionEstablished => 2,
            Message::FragmentationTest => 3,
            Message::PmtuVerified(_) => 4,
            Message::GossipUnicast { .. } => 5,
            Message::GossipBroadcast { .. } => 6,
            Message::Gossip { .. } => 7,
        }
    }

    pub fn cmd(&self) -> &'static str {
        match self {
            Message::Heartbeat => "heartbeat",
            Message::ConnectionEstablished => "established",
            Message::FragmentationTest => "fragtest",
            Message::PmtuVerified(_) => "pmtuverified",
            Message::GossipUnicast { .. } => "gossip-unicast",
            Message::GossipBroadcast { .. } => "gossip-broadcast",
            Message::Gossip { .. } => "gossip",
        }
    }
}

impl Encodable for Message {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.tag().encode(w)?;
        match self {
            Message::Heartbeat | Message::ConnectionEstablished | Message::FragmentationTest => {}
            Message::PmtuVerified(size) => len += size.encode(w)?,
            Message::GossipUnicast {
                channel,
                src,
                dst,
                payload,
            } => {
                len += channel.encode(w)?;
                len += src.encode(w)?;
                len += dst.encode(w)?;
                len += payload.encode(w)?;
            }
            Message::GossipBroadcast {
                channel,
                src,
                payload,
            } => {
                len += channel.encode(w)?;
                len += src.encode(w)?;
                len += payload.encode(w)?;
            }
            Message::Gossip { channel, payload } => {
                len += channel.encode(w)?;
                len += payload.encode(w)?;
            }
        }
        Ok(len)
    }
}

impl Decodable for Message {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        let tag = u8::decode(r)?;
        let msg = match tag {
            1 => Message::Heartbeat,
            2 => Message::ConnectionEstablished,
            3 => Message::FragmentationTest,
            4 => Message::PmtuVerified(u16::decode(r)?),
            5 => Message::GossipUnicast {
                channel: ChannelId::decode(r)?,
                src: PeerName::decode(r)?,
                dst: PeerName::decode(r)?,
                payload: Vec::decode(r)?,
            },
            6 => Message::GossipBroadcast {
                channel: ChannelId::decode(r)?,
                src: PeerName::decode(r)?,
                payload: Vec::decode(r)?,
            },
            7 => Message::Gossip {
                channel: ChannelId::decode(r)?,
                payload: Vec::decode(r)?,
            },
            other => return Err(wire::Error::UnknownTag(other)),
        };
        Ok(msg)
    }
}

/// The plaintext greeting opening every TCP connection.
///
/// Exchanged before anything else so both sides can reject a mismatch
/// (protocol, version, self-connect, encryption expectation) without
/// revealing any authenticated bytes. When `public_key` is present the
/// sender expects an encrypted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub name: PeerName,
    pub uid: PeerUid,
    pub nick_name: String,
    /// UDP port the sender receives frames and heartbeats on.
    pub udp_port: u16,
    /// Ephemeral key for the session key exchange, when a password is
    /// configured on the sender.
    pub public_key: Option<[u8; 32]>,
}

impl Encodable for Greeting {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = PROTOCOL_TAG.encode(w)?;
        len += PROTOCOL_VERSION.encode(w)?;
        len += self.name.encode(w)?;
        len += self.uid.encode(w)?;
        len += self.nick_name.encode(w)?;
        len += self.udp_port.encode(w)?;
        match &self.public_key {
            Some(key) => {
                len += 1u8.encode(w)?;
                w.write_all(key)?;
                len += key.len();
            }
            None => len += 0u8.encode(w)?,
        }
        Ok(len)
    }
}

impl Decodable for Greeting {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        let tag = String::decode(r)?;
        let version = u8::decode(r)?;
        if tag != PROTOCOL_TAG || version != PROTOCOL_VERSION {
            return Err(wire::Error::ProtocolMismatch);
        }
        let name = PeerName::decode(r)?;
        let uid = PeerUid::decode(r)?;
        let nick_name = String::decode(r)?;
        let udp_port = u16::decode(r)?;
        let public_key = match u8::decode(r)? {
            0 => None,
            _ => {
                let mut key = [0u8; 32];
                r.read_exact(&mut key)?;
                Some(key)
            }
        };
        Ok(Self {
            name,
            uid,
            nick_name,
            udp_port,
            public_key,
        })
    }
}

/// A UDP datagram. Self-delimited: the payload runs to the end of the
/// packet, and probe datagrams tolerate trailing padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// An encapsulated Ethernet frame in flight between peers.
    Frame {
        src: PeerName,
        dst: PeerName,
        frame: Vec<u8>,
    },
    /// Liveness probe, padded to the current PMTU by the sender.
    Heartbeat,
    /// PMTU probe, padded to the candidate PMTU by the sender.
    FragmentationTest,
}

impl Datagram {
    const TAG_FRAME: u8 = 0;
    const TAG_HEARTBEAT: u8 = 1;
    const TAG_FRAGTEST: u8 = 3;

    /// Encapsulation overhead of a frame datagram: tag plus the two
    /// peer names.
    pub const FRAME_OVERHEAD: usize = 1 + 8 + 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Datagram::Frame { src, dst, frame } => {
                buf.push(Self::TAG_FRAME);
                src.encode(&mut buf).expect("writing to an in-memory buffer doesn't fail");
                dst.encode(&mut buf).expect("writing to an in-memory buffer doesn't fail");
                buf.extend_from_slice(frame);
            }
            Datagram::Heartbeat => buf.push(Self::TAG_HEARTBEAT),
            Datagram::FragmentationTest => buf.push(Self::TAG_FRAGTEST),
        }
        buf
    }

    /// Serialize and pad with zeros up to `size` bytes.
    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.to_bytes();
        if buf.len() < size {
            buf.resize(size, 0);
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, wire::Error> {
        let mut r = bytes;
        let tag = u8::decode(&mut r)?;
        match tag {
            Self::TAG_FRAME => {
                let src = PeerName::decode(&mut r)?;
                let dst = PeerName::decode(&mut r)?;
                Ok(Datagram::Frame {
                    src,
                    dst,
                    frame: r.to_vec(),
                })
            }
            Self::TAG_HEARTBEAT => Ok(Datagram::Heartbeat),
            Self::TAG_FRAGTEST => Ok(Datagram::FragmentationTest),
            other => Err(wire::Error::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_to_vec;

    fn name(s: &str) -> PeerName {
        s.parse().unwrap()
    }

    #[test]
    fn channel_ids_are_stable() {
        assert_eq!(ChannelId::of("topology"), ChannelId::of("topology"));
        assert_ne!(ChannelId::of("topology"), ChannelId::of("IPallocation"));
    }

    #[test]
    fn message_tags_match_the_protocol() {
        assert_eq!(Message::Heartbeat.tag(), 1);
        assert_eq!(Message::ConnectionEstablished.tag(), 2);
        assert_eq!(Message::FragmentationTest.tag(), 3);
        assert_eq!(Message::PmtuVerified(1410).tag(), 4);
    }

    #[test]
    fn message_roundtrip() {
        let messages = vec![
            Message::Heartbeat,
            Message::ConnectionEstablished,
            Message::PmtuVerified(1410),
            Message::GossipUnicast {
                channel: ChannelId::of("IPallocation"),
                src: name("00:00:00:00:00:01"),
                dst: name("00:00:00:00:00:03"),
                payload: vec![1, 2, 3],
            },
            Message::GossipBroadcast {
                channel: ChannelId::of("topology"),
                src: name("00:00:00:00:00:01"),
                payload: vec![9; 32],
            },
            Message::Gossip {
                channel: ChannelId::of("topology"),
                payload: vec![],
            },
        ];
        for msg in messages {
            let bytes = encode_to_vec(&msg).unwrap();
            assert_eq!(bytes[0], msg.tag());
            assert_eq!(Message::decode(&mut bytes.as_slice()).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Message::decode(&mut [42u8].as_slice()).unwrap_err();
        assert!(matches!(err, wire::Error::UnknownTag(42)));
    }

    #[test]
    fn greeting_roundtrip() {
        let greeting = Greeting {
            name: name("00:00:00:00:00:01"),
            uid: PeerUid(7),
            nick_name: "alpha".into(),
            udp_port: 6783,
            public_key: Some([3u8; 32]),
        };
        let bytes = encode_to_vec(&greeting).unwrap();
        assert_eq!(Greeting::decode(&mut bytes.as_slice()).unwrap(), greeting);
    }

    #[test]
    fn greeting_rejects_wrong_version() {
        let greeting = Greeting {
            name: name("00:00:00:00:00:01"),
            uid: PeerUid(7),
            nick_name: "alpha".into(),
            udp_port: 6783,
            public_key: None,
        };
        let mut bytes = encode_to_vec(&greeting).unwrap();
        // The version byte follows the length-prefixed protocol tag.
        bytes[4 + PROTOCOL_TAG.len()] = 9;
        assert!(matches!(
            Greeting::decode(&mut bytes.as_slice()),
            Err(wire::Error::ProtocolMismatch)
        ));
    }

    #[test]
    fn heartbeat_padding_is_tolerated() {
        let bytes = Datagram::Heartbeat.to_padded_bytes(1410);
        assert_eq!(bytes.len(), 1410);
        assert_eq!(Datagram::from_bytes(&bytes).unwrap(), Datagram::Heartbeat);
    }

    #[test]
    fn frame_datagram_roundtrip() {
        let datagram = Datagram::Frame {
            src: name("00:00:00:00:00:01"),
            dst: name("00:00:00:00:00:02"),
            frame: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let bytes = datagram.to_bytes();
        assert_eq!(Datagram::from_bytes(&bytes).unwrap(), datagram);
    }
}
