use std::sync::Arc;

use tokio::select;
use tokio::signal::unix;
use tokio::signal::unix::SignalKind;
use tracing_subscriber::{filter::Targets, layer::Layer, prelude::*, util::SubscriberInitExt};

use crate::{
    cli::{arguments, node::Node},
    config::NodeConfig,
};

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let mut config = NodeConfig::from_path(&args.config)?;
    for peer in &args.peers {
        config.router.peers.push(peer.clone());
    }

    let level_filter = config.logger.level;

    // The router crates log under short explicit targets.
    let filter = Targets::new()
        .with_target("mesh", level_filter)
        .with_target("net", level_filter)
        .with_target("ipam", level_filter)
        .with_target("api", level_filter)
        .with_target("weaved", level_filter)
        .with_default(level_filter);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .try_init()?;

    let node = Arc::new(Node::new(config)?);
    let node_clone = node.clone();

    tokio::spawn(async move {
        if let Err(err) = node_clone.run().await {
            tracing::error!("Router cancelled: {:?}", err);
        }
        node_clone.task_tracker.close();
    });

    let mut sigterm =
        unix::signal(SignalKind::terminate()).expect("Failed to create SIGTERM signal handler");
    let mut sigint =
        unix::signal(SignalKind::interrupt()).expect("Failed to create SIGINT signal handler");

    select! {
        _ = node.cancelled() => {
            tracing::info!("Router run failed");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT signal");
        }
    }

    node.shutdown().await;

    Ok(())
}
