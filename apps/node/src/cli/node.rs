use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, trace};

use weave_api::ApiConfig;
use weave_ipam::Allocator;
use weave_mesh::client::handle::Handle as _;
use weave_mesh::client::MeshClient;
use weave_mesh::net::ReactorTcp;

use crate::config::NodeConfig;

/// The limit of time to wait for the router to shut down.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Node encapsulates the router services' start.
pub struct Node {
    config: NodeConfig,
    cancelation: CancellationToken,
    pub(crate) task_tracker: TaskTracker,
}

impl Node {
    pub fn new(config: NodeConfig) -> eyre::Result<Self> {
        Ok(Self {
            config,
            cancelation: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Wait for the signal from any service about the cancellation.
    pub async fn cancelled(&self) {
        self.cancelation.cancelled().await
    }

    pub async fn run(&self) -> eyre::Result<()> {
        let mesh_config = self.config.router.to_mesh_config()?;
        let name = mesh_config.name;

        info!(
            "our name is {} ({}), listening on {}",
            name, mesh_config.nick_name, mesh_config.listen
        );

        let client = MeshClient::<ReactorTcp>::new(mesh_config)?;
        let handle = client.handle();
        let injector = client.injector();

        self.task_tracker.spawn(client.run(self.cancelation.clone()));

        // The host driver owns the real capture device and bridges
        // this queue to it; standalone we only account for the frames.
        let inject_cancel = self.cancelation.clone();
        self.task_tracker.spawn(async move {
            loop {
                select! {
                    _ = inject_cancel.cancelled() => return,
                    frame = injector.recv_async() => match frame {
                        Ok(frame) => trace!("{} byte frame awaiting local injection", frame.len()),
                        Err(_) => return,
                    }
                }
            }
        });

        let ipam_config = self.config.ipam.to_allocator_config(&self.config.router)?;
        let gossip = handle
            .register_channel(weave_ipam::CHANNEL)
            .await
            .map_err(|err| eyre::eyre!("failed to register the ipam channel: {err}"))?;
        let (allocator, ipam_handle) = Allocator::new(name, ipam_config, handle.clone(), gossip);
        self.task_tracker
            .spawn(allocator.run(self.cancelation.clone()));

        let api_config = ApiConfig {
            listen: self.config.http.listen()?,
        };
        self.task_tracker.spawn(weave_api::run_server(
            api_config,
            handle,
            ipam_handle,
            self.cancelation.clone(),
        ));

        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down router, finishing received requests...");

        self.cancelation.cancel();

        let timeout = self
            .config
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        select! {
            // Wait until all tasks are finished
            _ = self.task_tracker.wait() => {},
            // Or wait for and exit by timeout
            _ = sleep(Duration::from_secs(timeout)) => {
                info!("Shutdown timeout reached, exiting...");
            },
        }
    }
}
