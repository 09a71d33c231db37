use std::path::PathBuf;

use clap::Args;

#[derive(Args)]
pub struct Run {
    /// Path to the router configuration file.
    #[clap(long, short, default_value = "weave.toml")]
    pub config: PathBuf,

    /// Additional peers to connect to, on top of the configured ones.
    #[clap(long = "peer")]
    pub peers: Vec<String>,
}
