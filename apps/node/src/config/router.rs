use std::net::{SocketAddr, ToSocketAddrs};

use eyre::{Context, OptionExt};
use serde::Deserialize;

use weave_mesh::client::MeshConfig;
use weave_mesh::fsm::peermgr::DEFAULT_CONN_LIMIT;
use weave_types::{PeerName, DEFAULT_PORT};

#[derive(Deserialize, Clone)]
pub struct RouterConfig {
    /// Stable peer name, colon-hex. The host driver derives it from
    /// the bridge MAC; without one a random name is drawn, which
    /// changes across restarts.
    #[serde(default)]
    pub name: Option<String>,

    /// Friendly name shown in status output; defaults to the name.
    #[serde(default)]
    pub nickname: Option<String>,

    /// Address to listen for peers on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Router port, for both TCP and UDP.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Cluster password; enables encryption everywhere.
    #[serde(default)]
    pub password: Option<String>,

    /// Peers to connect to at startup.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Maximum concurrent connections.
    #[serde(default = "default_conn_limit")]
    pub conn_limit: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_conn_limit() -> usize {
    DEFAULT_CONN_LIMIT
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: None,
            nickname: None,
            host: default_host(),
            port: default_port(),
            password: None,
            peers: Vec::new(),
            conn_limit: default_conn_limit(),
        }
    }
}

/// Resolve a `host[:port]` peer specification against the default
/// router port.
pub fn resolve_peer(spec: &str, default_port: u16) -> eyre::Result<SocketAddr> {
    let candidate = if spec.contains(':') {
        spec.to_owned()
    } else {
        format!("{spec}:{default_port}")
    };
    candidate
        .to_socket_addrs()
        .wrap_err_with(|| format!("failed to resolve peer address `{spec}`"))?
        .next()
        .ok_or_eyre("no address found for peer")
}

impl RouterConfig {
    pub fn name(&self) -> eyre::Result<PeerName> {
        match &self.name {
            Some(name) => name
                .parse()
                .map_err(|_| eyre::eyre!("invalid peer name `{name}`")),
            None => {
                // Random 48-bit name, never the reserved zero.
                let mut rng = fastrand::Rng::new();
                Ok(PeerName::new(rng.u64(1..(1 << 48))))
            }
        }
    }

    pub fn to_mesh_config(&self) -> eyre::Result<MeshConfig> {
        let name = self.name()?;
        let nick_name = self
            .nickname
            .clone()
            .unwrap_or_else(|| name.to_string());

        let listen: SocketAddr = format!("{}:{}", self.host, self.port)
            .to_socket_addrs()
            .wrap_err("failed to resolve listen address")?
            .next()
            .ok_or_eyre("no address found for listen address")?;

        let peers = self
            .peers
            .iter()
            .map(|spec| resolve_peer(spec, self.port))
            .collect::<Result<Vec<_>, _>>()?;

        let mut config = MeshConfig::new(name, nick_name, listen, peers);
        config.password = self.password.clone();
        config.conn_limit = self.conn_limit;
        Ok(config)
    }
}
