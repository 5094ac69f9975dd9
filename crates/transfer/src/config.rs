use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use camlink_protocol::constants::{
    ACK_TIMEOUT, DEFAULT_CHUNK_SIZE, MAX_RETRIES_PER_CHUNK, READY_TIMEOUT, VERIFY_TIMEOUT,
};

/// Transfer tuning, usually the `[transfer]` table of the config file.
///
/// Timeouts are in seconds and may be fractional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Payload bytes per `CHUNK`.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Seconds to wait for `READY` after `HEADER`.
    #[serde(default = "default_timeout_ready")]
    pub timeout_ready: f64,

    /// Seconds to wait for `CHUNK_READY`, then again for `ACK`.
    #[serde(default = "default_timeout_ack")]
    pub timeout_ack: f64,

    /// Seconds to wait for `DONE` after `VERIFY`.
    #[serde(default = "default_timeout_verify")]
    pub timeout_verify: f64,

    /// Attempts per chunk before the session fails.
    #[serde(default = "default_max_retries")]
    pub max_retries_per_chunk: u32,

    /// Compress files with zlib before sending.
    #[serde(default)]
    pub compression_enabled: bool,

    /// zlib level, 0-9.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Free space the receiver keeps in reserve beyond the file itself.
    #[serde(default = "default_free_space_margin")]
    pub free_space_margin: u64,

    /// Where compressed copies are staged. System temp dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_timeout_ready() -> f64 {
    READY_TIMEOUT.as_secs_f64()
}

fn default_timeout_ack() -> f64 {
    ACK_TIMEOUT.as_secs_f64()
}

fn default_timeout_verify() -> f64 {
    VERIFY_TIMEOUT.as_secs_f64()
}

fn default_max_retries() -> u32 {
    MAX_RETRIES_PER_CHUNK
}

fn default_compression_level() -> u32 {
    6
}

fn default_free_space_margin() -> u64 {
    1024 * 1024
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            timeout_ready: default_timeout_ready(),
            timeout_ack: default_timeout_ack(),
            timeout_verify: default_timeout_verify(),
            max_retries_per_chunk: default_max_retries(),
            compression_enabled: false,
            compression_level: default_compression_level(),
            free_space_margin: default_free_space_margin(),
            temp_dir: None,
        }
    }
}

/// Converts a configured number of seconds, refusing values that would
/// make a wait unbounded or instantaneous.
fn seconds(value: f64, fallback: Duration) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value.clamp(0.001, 86_400.0))
    } else {
        fallback
    }
}

impl TransferConfig {
    /// Chunk size clamped to what a `CHUNK` line can announce.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, u16::MAX as usize)
    }

    pub fn ready_timeout(&self) -> Duration {
        seconds(self.timeout_ready, READY_TIMEOUT)
    }

    pub fn ack_timeout(&self) -> Duration {
        seconds(self.timeout_ack, ACK_TIMEOUT)
    }

    pub fn verify_timeout(&self) -> Duration {
        seconds(self.timeout_verify, VERIFY_TIMEOUT)
    }

    /// How long a receiver waits for the next frame from the sender.
    ///
    /// Covers a full retry cycle on the sender side: every attempt may
    /// spend two ack timeouts before the next `CHUNK` line.
    pub fn frame_timeout(&self) -> Duration {
        let retry_cycle = self.ack_timeout() * 2 * self.attempts_per_chunk();
        retry_cycle.max(self.verify_timeout())
    }

    /// Attempts per chunk, at least one.
    pub fn attempts_per_chunk(&self) -> u32 {
        self.max_retries_per_chunk.max(1)
    }

    pub fn compression_level(&self) -> u32 {
        self.compression_level.min(9)
    }
}
