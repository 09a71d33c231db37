//! Peer identity and gossiped peer records.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::mac::Mac;
use crate::wire::{self, Decodable, Encodable};

/// Stable 64-bit peer identity, rendered as colon-separated hex.
///
/// Names derived from an interface MAC occupy the low 48 bits and print
/// in the familiar six-group form. Ordering is numeric, which for the
/// fixed-width rendering coincides with lexicographic order of the
/// string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerName(u64);

impl PeerName {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The reserved all-zero name addressing every peer; used as the
    /// destination of tree-broadcast frames. No real peer derives it:
    /// names come from interface MACs or a non-zero random draw.
    pub const fn broadcast() -> Self {
        Self(0)
    }

    /// Derive a name from a hardware address.
    pub fn from_mac(mac: Mac) -> Self {
        let octets = mac.octets();
        let mut value = 0u64;
        for b in octets {
            value = value << 8 | b as u64;
        }
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        // Print eight groups only when the high bits are in use.
        let start = if self.0 >> 48 == 0 { 2 } else { 0 };
        let groups: Vec<String> = bytes[start..].iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", groups.join(":"))
    }
}

impl FromStr for PeerName {
    type Err = wire::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let groups: Vec<&str> = s.split(':').collect();
        if groups.len() != 6 && groups.len() != 8 {
            return Err(wire::Error::InvalidPeerName(s.to_owned()));
        }
        let mut value = 0u64;
        for group in groups {
            let byte =
                u8::from_str_radix(group, 16).map_err(|_| wire::Error::InvalidPeerName(s.to_owned()))?;
            value = value << 8 | byte as u64;
        }
        Ok(Self(value))
    }
}

impl Serialize for PeerName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Encodable for PeerName {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.encode(w)
    }
}

impl Decodable for PeerName {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        Ok(Self(u64::decode(r)?))
    }
}

/// Random per-incarnation identifier. Two peers with equal name but
/// different uid are distinct incarnations of the same logical peer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PeerUid(pub u64);

impl fmt::Display for PeerUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Encodable for PeerUid {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.encode(w)
    }
}

impl Decodable for PeerUid {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        Ok(Self(u64::decode(r)?))
    }
}

/// One edge of the topology as advertised by its source peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    /// Remote address of the connection, when known to the advertiser.
    pub addr: Option<SocketAddr>,
    /// Whether the advertiser considers the connection established.
    pub established: bool,
}

impl Encodable for ConnectionSummary {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        match &self.addr {
            Some(addr) => {
                len += 1u8.encode(w)?;
                len += addr.to_string().encode(w)?;
            }
            None => len += 0u8.encode(w)?,
        }
        len += (self.established as u8).encode(w)?;
        Ok(len)
    }
}

impl Decodable for ConnectionSummary {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        let addr = match u8::decode(r)? {
            0 => None,
            _ => {
                let s = String::decode(r)?;
                Some(s.parse().map_err(|_| wire::Error::InvalidAddress(s))?)
            }
        };
        let established = u8::decode(r)? != 0;
        Ok(Self { addr, established })
    }
}

/// A gossiped peer record.
///
/// The version counter is bumped by the owning peer on every change to
/// its connection set; receivers merge records by version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: PeerName,
    pub nick_name: String,
    pub uid: PeerUid,
    pub version: u64,
    pub connections: BTreeMap<PeerName, ConnectionSummary>,
}

impl Peer {
    pub fn new(name: PeerName, nick_name: impl Into<String>, uid: PeerUid) -> Self {
        Self {
            name,
            nick_name: nick_name.into(),
            uid,
            version: 0,
            connections: BTreeMap::new(),
        }
    }

    /// Established edges advertised by this peer.
    pub fn established(&self) -> impl Iterator<Item = PeerName> + '_ {
        self.connections
            .iter()
            .filter(|(_, c)| c.established)
            .map(|(name, _)| *name)
    }
}

impl Encodable for Peer {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.name.encode(w)?;
        len += self.nick_name.encode(w)?;
        len += self.uid.encode(w)?;
        len += self.version.encode(w)?;
        len += (self.connections.len() as u32).encode(w)?;
        for (name, summary) in &self.connections {
            len += name.encode(w)?;
            len += summary.encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for Peer {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        let name = PeerName::decode(r)?;
        let nick_name = String::decode(r)?;
        let uid = PeerUid::decode(r)?;
        let version = u64::decode(r)?;
        let count = u32::decode(r)?;
        let mut connections = BTreeMap::new();
        for _ in 0..count {
            let name = PeerName::decode(r)?;
            let summary = ConnectionSummary::decode(r)?;
            connections.insert(name, summary);
        }
        Ok(Self {
            name,
            nick_name,
            uid,
            version,
            connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_renders_as_mac() {
        let name = PeerName::from_mac(Mac::new([0, 0, 0, 0, 0, 1]));
        assert_eq!(name.to_string(), "00:00:00:00:00:01");
        assert_eq!("00:00:00:00:00:01".parse::<PeerName>().unwrap(), name);
    }

    #[test]
    fn name_parse_rejects_garbage() {
        assert!("00:00".parse::<PeerName>().is_err());
        assert!("zz:00:00:00:00:01".parse::<PeerName>().is_err());
    }

    #[test]
    fn name_order_matches_rendering() {
        let a: PeerName = "00:00:00:00:00:01".parse().unwrap();
        let b: PeerName = "00:00:00:00:00:02".parse().unwrap();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn peer_roundtrip() {
        let mut peer = Peer::new(
            "00:00:00:00:00:01".parse().unwrap(),
            "alpha",
            PeerUid(42),
        );
        peer.version = 7;
        peer.connections.insert(
            "00:00:00:00:00:02".parse().unwrap(),
            ConnectionSummary {
                addr: Some("10.0.0.2:6783".parse().unwrap()),
                established: true,
            },
        );

        let bytes = wire::encode_to_vec(&peer).unwrap();
        let decoded = Peer::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, peer);
    }
}
