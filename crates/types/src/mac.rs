//! Ethernet hardware addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::wire;

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mac([u8; 6]);

impl Mac {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Group bit covers both broadcast and multicast destinations.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Destination address of a raw Ethernet frame, if long enough.
    pub fn frame_dst(frame: &[u8]) -> Option<Mac> {
        frame.get(0..6).map(|b| Mac(b.try_into().expect("slice is six bytes")))
    }

    /// Source address of a raw Ethernet frame, if long enough.
    pub fn frame_src(frame: &[u8]) -> Option<Mac> {
        frame.get(6..12).map(|b| Mac(b.try_into().expect("slice is six bytes")))
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for Mac {
    type Err = wire::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let groups: Vec<&str> = s.split(':').collect();
        if groups.len() != 6 {
            return Err(wire::Error::InvalidAddress(s.to_owned()));
        }
        for (i, group) in groups.iter().enumerate() {
            octets[i] = u8::from_str_radix(group, 16)
                .map_err(|_| wire::Error::InvalidAddress(s.to_owned()))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for Mac {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_and_multicast_share_the_group_bit() {
        assert!(Mac::new([0xff; 6]).is_multicast());
        assert!(Mac::new([0x01, 0, 0x5e, 0, 0, 1]).is_multicast());
        assert!(!Mac::new([0x02, 0, 0, 0, 0, 1]).is_multicast());
    }

    #[test]
    fn frame_addresses() {
        let mut frame = vec![0u8; 64];
        frame[0..6].copy_from_slice(&[0xff; 6]);
        frame[6..12].copy_from_slice(&[2, 0, 0, 0, 0, 9]);

        assert_eq!(Mac::frame_dst(&frame), Some(Mac::new([0xff; 6])));
        assert_eq!(Mac::frame_src(&frame), Some(Mac::new([2, 0, 0, 0, 0, 9])));
        assert_eq!(Mac::frame_dst(&frame[..4]), None);
    }
}
