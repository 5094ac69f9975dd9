//! `camlink serve`: the device daemon.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use camlink_dispatch::Dispatcher;
use camlink_supervisor::{StatusBoard, Supervisor};

use crate::capture::FsCaptureProvider;
use crate::commands::{self, Device};
use crate::config::Config;
use crate::connectors;

/// Serves the configured link until `salir` or an interrupt.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let status = StatusBoard::new();

    let captures = FsCaptureProvider::from_config(&config.capture);
    info!(dir = %captures.dir().display(), "photo directory");

    let device = Arc::new(Device::new(
        Arc::new(captures),
        status.clone(),
        config.link.port_name(),
        config.link.baud_rate,
        config.capture.keep_latest,
        shutdown.clone(),
    ));
    let registry = commands::registry(device);
    info!(commands = registry.len(), "command set registered");

    let supervisor = Supervisor::new(
        Dispatcher::new(registry),
        status,
        config.to_supervisor_config(),
    );
    let connector = connectors::from_config(&config.link);

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    supervisor.run(connector.as_ref(), shutdown).await?;
    Ok(())
}
