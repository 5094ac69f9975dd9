//! Daemon configuration.
//!
//! Stored as TOML at `~/.config/camlink/camlink.toml` unless `--config`
//! names another file. Every field has a default, so a missing file or a
//! partial one is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use camlink_link::{LinkConfig, ReconnectConfig};
use camlink_protocol::constants::MAX_LINE_LENGTH;
use camlink_supervisor::SupervisorConfig;
use camlink_transfer::TransferConfig;

/// Top-level `camlink.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where `final_stats.json` is written on shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub link: LinkSection,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub capture: CaptureSection,
}

/// `[link]`: which channel to open and how to keep it alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSection {
    /// Serial device, e.g. `/dev/ttyS0`.
    #[serde(default = "default_device")]
    pub device: String,

    /// `host:port` of a serial-over-TCP bridge. Takes precedence over
    /// `device` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Idle seconds before a heartbeat line. 0 disables heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_reconnect_backoff_factor")]
    pub reconnect_backoff_factor: f64,
}

/// `[capture]`: where photos live and how they are taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSection {
    #[serde(default = "default_photo_dir")]
    pub photo_dir: PathBuf,

    /// Capture program and arguments. `{path}` is replaced by the output
    /// file.
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// File extension of captures, without the dot.
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Photos kept by `limpiar` when no count is given.
    #[serde(default = "default_keep_latest")]
    pub keep_latest: usize,
}

fn default_device() -> String {
    "/dev/ttyS0".into()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_line_length() -> usize {
    MAX_LINE_LENGTH
}

fn default_reconnect_initial_ms() -> u64 {
    250
}

fn default_reconnect_max_ms() -> u64 {
    15_000
}

fn default_reconnect_backoff_factor() -> f64 {
    2.0
}

fn default_photo_dir() -> PathBuf {
    home_dir().join("camlink").join("photos")
}

fn default_command() -> Vec<String> {
    ["rpicam-still", "--nopreview", "-o", "{path}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_extension() -> String {
    "jpg".into()
}

fn default_keep_latest() -> usize {
    10
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            device: default_device(),
            tcp: None,
            baud_rate: default_baud_rate(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_line_length: default_max_line_length(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_backoff_factor: default_reconnect_backoff_factor(),
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            photo_dir: default_photo_dir(),
            command: default_command(),
            extension: default_extension(),
            keep_latest: default_keep_latest(),
        }
    }
}

impl LinkSection {
    /// Endpoint name used in logs and `STATUS` replies.
    pub fn port_name(&self) -> &str {
        self.tcp.as_deref().unwrap_or(&self.device)
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            max_line_length: self.max_line_length.max(1),
            ..LinkConfig::default()
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
            backoff_factor: self.reconnect_backoff_factor,
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

impl Config {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing file yields the defaults; nothing is written to disk.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            link: self.link.link_config(),
            reconnect: self.link.reconnect_config(),
            transfer: self.transfer.clone(),
            heartbeat_interval: self.link.heartbeat_interval(),
            state_dir: self.state_dir.clone(),
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

/// Default configuration file path.
fn config_path() -> PathBuf {
    home_dir().join(".config").join("camlink").join("camlink.toml")
}
