//! The token ring dividing a CIDR into ownership ranges.
//!
//! A token at address `t` owned by peer `P` gives `P` the half-open
//! range from `t` up to the next token, wrapping circularly at the end
//! of the CIDR. Tokens are never removed; ownership moves by bumping a
//! token's version, and rings merge commutatively by keeping the
//! higher version per token.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use weave_types::PeerName;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("rings cover different ranges")]
    RangeMismatch,
    #[error("token {0} has two owners at the same version")]
    Conflict(Ipv4Addr),
}

/// One entry of the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub token: Ipv4Addr,
    pub owner: PeerName,
    pub version: u64,
}

/// The ownership ring over a CIDR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ring {
    range: Ipv4Net,
    /// Sorted by token address.
    tokens: Vec<Token>,
}

impl Ring {
    pub fn new(range: Ipv4Net) -> Self {
        Self {
            range: range.trunc(),
            tokens: Vec::new(),
        }
    }

    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    /// An empty ring owns nothing; allocation waits for a seed.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    fn base(&self) -> u32 {
        u32::from(self.range.network())
    }

    fn top(&self) -> u32 {
        u32::from(self.range.broadcast()) + 1
    }

    /// Network and broadcast addresses are never handed out.
    fn is_usable(&self, addr: u32) -> bool {
        addr != u32::from(self.range.network()) && addr != u32::from(self.range.broadcast())
    }

    /// Claim the entire range with a single token. Only valid on an
    /// empty ring; the quorum rules decide who calls this.
    pub fn seed(&mut self, owner: PeerName) {
        debug_assert!(self.tokens.is_empty());
        self.tokens = vec![Token {
            token: self.range.network(),
            owner,
            version: 1,
        }];
    }

    /// Merge a received ring. Returns whether anything changed
    /// locally. Merging is commutative and idempotent: per token, the
    /// higher version wins; unknown tokens are inserted.
    pub fn merge(&mut self, other: &Ring) -> Result<bool, RingError> {
        if other.range != self.range {
            return Err(RingError::RangeMismatch);
        }

        let mut merged: BTreeMap<Ipv4Addr, Token> = self
            .tokens
            .iter()
            .map(|t| (t.token, t.clone()))
            .collect();
        let mut changed = false;

        for token in &other.tokens {
            match merged.get(&token.token) {
                None => {
                    merged.insert(token.token, token.clone());
                    changed = true;
                }
                Some(known) if token.version > known.version => {
                    merged.insert(token.token, token.clone());
                    changed = true;
                }
                Some(known) if token.version == known.version && known.owner != token.owner => {
                    return Err(RingError::Conflict(token.token));
                }
                Some(_) => {}
            }
        }

        if changed {
            self.tokens = merged.into_values().collect();
        }
        Ok(changed)
    }

    /// Owner of the range containing `addr`, if the ring is seeded.
    pub fn owner_of(&self, addr: Ipv4Addr) -> Option<PeerName> {
        if self.tokens.is_empty() || !self.range.contains(&addr) {
            return None;
        }
        // The owning token is the last one at or before the address;
        // if the address precedes every token, the ring wraps and the
        // last token owns it.
        let addr = u32::from(addr);
        let owner = self
            .tokens
            .iter()
            .rev()
            .find(|t| u32::from(t.token) <= addr)
            .unwrap_or_else(|| self.tokens.last().expect("ring is non-empty"));
        Some(owner.owner)
    }

    /// The address segments owned by a peer, as `[start, end)` pairs.
    /// A wrapping segment is returned split in two.
    pub fn owned_segments(&self, owner: PeerName) -> Vec<(u32, u32)> {
        let mut segments = Vec::new();

        for (i, token) in self.tokens.iter().enumerate() {
            if token.owner != owner {
                continue;
            }
            let start = u32::from(token.token);
            match self.tokens.get(i + 1) {
                Some(next) => segments.push((start, u32::from(next.token))),
                None => {
                    // Last token: wraps past the top to the first.
                    segments.push((start, self.top()));
                    let first = u32::from(self.tokens[0].token);
                    if first > self.base() {
                        segments.push((self.base(), first));
                    }
                }
            }
        }
        segments
    }

    /// Number of usable addresses a peer owns.
    pub fn owned_count(&self, owner: PeerName) -> u64 {
        let network = u32::from(self.range.network());
        let broadcast = u32::from(self.range.broadcast());

        self.owned_segments(owner)
            .iter()
            .map(|&(start, end)| {
                let mut count = (end - start) as u64;
                if (start..end).contains(&network) {
                    count -= 1;
                }
                if (start..end).contains(&broadcast) {
                    count -= 1;
                }
                count
            })
            .sum()
    }

    /// The lowest usable address owned by `owner` that passes the
    /// filter.
    pub fn lowest_free(
        &self,
        owner: PeerName,
        available: impl Fn(Ipv4Addr) -> bool,
    ) -> Option<Ipv4Addr> {
        let mut segments = self.owned_segments(owner);
        segments.sort_unstable();

        for (start, end) in segments {
            for addr in start..end {
                if !self.is_usable(addr) {
                    continue;
                }
                let ip = Ipv4Addr::from(addr);
                if available(ip) {
                    return Some(ip);
                }
            }
        }
        None
    }

    /// Donate up to half of the donor's largest segment to another
    /// peer, never giving away a leased address: the split point sits
    /// above every claim in the segment. Returns `false` when the
    /// donor has no free tail to give.
    pub fn donate(
        &mut self,
        from: PeerName,
        to: PeerName,
        is_free: impl Fn(Ipv4Addr) -> bool,
    ) -> bool {
        let mut segments = self.owned_segments(from);
        segments.sort_unstable_by_key(|&(start, end)| std::cmp::Reverse(end - start));

        for (start, end) in segments {
            // Longest run of donatable addresses at the top of the
            // segment.
            let mut cut = end;
            while cut > start {
                let addr = cut - 1;
                if self.is_usable(addr) && !is_free(Ipv4Addr::from(addr)) {
                    break;
                }
                cut -= 1;
            }
            if cut == end {
                continue;
            }

            let mid = start + (end - start) / 2;
            let split = mid.max(cut);

            if split == start {
                // A single-address segment moves whole.
                let token = self
                    .tokens
                    .iter_mut()
                    .find(|t| t.owner == from && u32::from(t.token) == start)
                    .expect("segment start is a token of the donor");
                token.owner = to;
                token.version += 1;
            } else {
                self.tokens.push(Token {
                    token: Ipv4Addr::from(split),
                    owner: to,
                    version: 1,
                });
                self.tokens.sort_unstable_by_key(|t| t.token);
            }
            return true;
        }
        false
    }

    /// Reassign every token of a (dead) peer to another owner.
    /// Returns the number of tokens moved.
    pub fn reassign(&mut self, from: PeerName, to: PeerName) -> usize {
        let mut moved = 0;
        for token in self.tokens.iter_mut() {
            if token.owner == from {
                token.owner = to;
                token.version += 1;
                moved += 1;
            }
        }
        moved
    }

    /// Every owner with at least one token.
    pub fn owners(&self) -> Vec<PeerName> {
        let mut owners: Vec<PeerName> = self.tokens.iter().map(|t| t.owner).collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Check the structural invariants: tokens sorted, unique, inside
    /// the range. With any tokens at all, coverage and single
    /// ownership follow from the circular construction.
    pub fn check_invariants(&self) -> bool {
        self.tokens
            .windows(2)
            .all(|pair| pair[0].token < pair[1].token)
            && self.tokens.iter().all(|t| self.range.contains(&t.token))
    }
}
