use config::Config;
use serde::Deserialize;

use std::path::Path;

mod http;
pub use http::HttpConfig;

mod ipam;
pub use ipam::IpamConfig;

mod logger;
pub use logger::LoggerConfig;

mod router;
pub use router::RouterConfig;

#[derive(Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub ipam: IpamConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
}

impl NodeConfig {
    pub fn from_path(path: &Path) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .build()?;

        let mut config: NodeConfig = config.try_deserialize()?;

        // The environment wins over the file for the cluster secret
        // and the router port.
        if let Ok(password) = std::env::var("WEAVE_PASSWORD") {
            if !password.is_empty() {
                config.router.password = Some(password);
            }
        }
        if let Ok(port) = std::env::var("WEAVE_PORT") {
            config.router.port = port
                .parse()
                .map_err(|_| eyre::eyre!("WEAVE_PORT is not a port number: {port}"))?;
        }

        Ok(config)
    }
}
