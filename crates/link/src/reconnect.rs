//! Reconnection with exponential backoff.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::{BoxedReader, BoxedWriter};

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = io::Result<(BoxedReader, BoxedWriter)>> + Send + 'a>>;

/// Opens the physical channel (serial device, TCP bridge, ...).
pub trait Connector: Send + Sync {
    fn connect(&self) -> ConnectFuture<'_>;

    /// Human-readable endpoint for logs and status replies.
    fn describe(&self) -> String;
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_secs_f64((base + base * 0.25 * offset).max(0.05))
    }

    /// Delay before attempt `attempt` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Retries `connector` until it succeeds or `cancel` fires.
///
/// Returns `None` only on cancellation.
pub async fn connect_with_backoff(
    connector: &dyn Connector,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<(BoxedReader, BoxedWriter)> {
    let endpoint = connector.describe();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        match connector.connect().await {
            Ok(halves) => {
                info!(%endpoint, attempt, "link connected");
                return Some(halves);
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    %endpoint,
                    attempt,
                    error = %e,
                    delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
                    "connect attempt failed"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(%endpoint, "reconnect cancelled");
                        return None;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
