use ipnet::Ipv4Net;
use serde::Deserialize;

use super::router::RouterConfig;

#[derive(Deserialize, Clone)]
pub struct IpamConfig {
    /// The CIDR to allocate container addresses from.
    #[serde(default = "default_range")]
    pub range: Ipv4Net,

    /// Expected size of the initial cluster; drives the bootstrap
    /// quorum. When absent the quorum is estimated from the peer
    /// list.
    #[serde(default)]
    pub init_peer_count: Option<usize>,
}

fn default_range() -> Ipv4Net {
    "10.32.0.0/12".parse().expect("the default range parses")
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            range: default_range(),
            init_peer_count: None,
        }
    }
}

impl IpamConfig {
    pub fn to_allocator_config(&self, router: &RouterConfig) -> eyre::Result<weave_ipam::Config> {
        let quorum = weave_ipam::quorum(self.init_peer_count, router.peers.len());
        Ok(weave_ipam::Config::new(self.range, quorum))
    }
}
