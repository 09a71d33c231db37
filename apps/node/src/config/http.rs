use std::net::SocketAddr;

use serde::Deserialize;

#[derive(Deserialize, Clone)]
pub struct HttpConfig {
    /// Where the control API listens. Keep it on loopback: the API
    /// carries no authentication.
    #[serde(default = "default_address")]
    pub address: String,
}

fn default_address() -> String {
    "127.0.0.1:6784".to_owned()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

impl HttpConfig {
    pub fn listen(&self) -> eyre::Result<SocketAddr> {
        self.address
            .parse()
            .map_err(|_| eyre::eyre!("invalid control API address `{}`", self.address))
    }
}
