//! Local address leases, keyed by container identity.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::Serialize;

/// The set of addresses this peer has leased to local containers.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Claims {
    by_container: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    #[serde(skip)]
    by_addr: BTreeMap<Ipv4Addr, String>,
}

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lease. Claiming the same address again for the same
    /// container is a no-op; for a different container it fails.
    pub fn claim(&mut self, container: &str, addr: Ipv4Addr) -> bool {
        match self.by_addr.get(&addr) {
            Some(holder) if holder != container => false,
            _ => {
                self.by_addr.insert(addr, container.to_owned());
                self.by_container
                    .entry(container.to_owned())
                    .or_default()
                    .insert(addr);
                true
            }
        }
    }

    /// Release every lease held by a container, returning the freed
    /// addresses.
    pub fn release(&mut self, container: &str) -> Vec<Ipv4Addr> {
        let addrs: Vec<Ipv4Addr> = self
            .by_container
            .remove(container)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for addr in &addrs {
            self.by_addr.remove(addr);
        }
        addrs
    }

    pub fn is_claimed(&self, addr: Ipv4Addr) -> bool {
        self.by_addr.contains_key(&addr)
    }

    pub fn holder(&self, addr: Ipv4Addr) -> Option<&str> {
        self.by_addr.get(&addr).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn containers(&self) -> impl Iterator<Item = (&String, &BTreeSet<Ipv4Addr>)> {
        self.by_container.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn claims_are_exclusive_per_address() {
        let mut claims = Claims::new();

        assert!(claims.claim("web", ip("10.2.0.1")));
        assert!(claims.claim("web", ip("10.2.0.1")));
        assert!(!claims.claim("db", ip("10.2.0.1")));
        assert_eq!(claims.holder(ip("10.2.0.1")), Some("web"));
    }

    #[test]
    fn release_frees_every_lease_of_the_container() {
        let mut claims = Claims::new();
        claims.claim("web", ip("10.2.0.1"));
        claims.claim("web", ip("10.2.0.2"));
        claims.claim("db", ip("10.2.0.3"));

        let freed = claims.release("web");
        assert_eq!(freed, vec![ip("10.2.0.1"), ip("10.2.0.2")]);
        assert!(!claims.is_claimed(ip("10.2.0.1")));
        assert!(claims.is_claimed(ip("10.2.0.3")));

        // Releasing an unknown container frees nothing.
        assert!(claims.release("ghost").is_empty());
    }
}
