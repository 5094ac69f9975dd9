use std::path::PathBuf;
use std::time::Duration;

use camlink_link::{LinkConfig, ReconnectConfig};
use camlink_transfer::TransferConfig;

/// Runtime settings for a [`Supervisor`](crate::Supervisor).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub link: LinkConfig,
    pub reconnect: ReconnectConfig,
    pub transfer: TransferConfig,
    /// Idle time before a `HEARTBEAT` line. `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Where `final_stats.json` is written on shutdown.
    pub state_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            reconnect: ReconnectConfig::default(),
            transfer: TransferConfig::default(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            state_dir: None,
        }
    }
}
