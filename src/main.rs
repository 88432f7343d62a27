pub mod config;
pub mod demux;
pub mod docker;
pub mod events;
pub mod forward;
pub mod labels;
pub mod logs;
pub mod registry;
pub mod relay;
pub mod state;
pub mod stats;

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::docker::DockerRuntime;
use crate::forward::{tls_dial, ForwardingChannel};
use crate::registry::ContainerRegistry;
use crate::relay::Relay;
use crate::state::RelayState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // config trouble must stop the process before anything dials out
    let cfg = RelayConfig::from_env()?;

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let docker = DockerRuntime::connect().await?;

    let dial = tls_dial(&cfg.intake.host, cfg.intake.port)?;
    let (channel, forward, authorized) = ForwardingChannel::new(cfg.apikey, dial);

    let state = Arc::new(RelayState {
        docker,
        registry: ContainerRegistry::new(),
        labels: cfg.labels,
        marker: cfg.marker,
        forward,
    });

    let forward_task = tokio::spawn(channel.run());
    let relay_task = tokio::spawn(Relay::new(Arc::clone(&state), authorized).run());

    if let Err(e) = signal::ctrl_c().await {
        warn!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");

    relay_task.abort();
    forward_task.abort();

    info!("logship terminated");
    Ok(())
}
