use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use camlink_dispatch::DispatchStats;
use camlink_link::LinkStatsSnapshot;
use camlink_protocol::constants::HISTORY_LIMIT;
use camlink_transfer::{TransferProgress, TransferRecord, TransferState};

use crate::SupervisorError;

/// Aggregate transfer statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferTotals {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_bytes: u64,
    pub avg_throughput_bps: f64,
    pub max_throughput_bps: f64,
}

impl TransferTotals {
    /// Share of finished transfers that completed, 0-100.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed + self.cancelled;
        if finished == 0 {
            return 0.0;
        }
        self.completed as f64 / finished as f64 * 100.0
    }

    fn add(&mut self, record: &TransferRecord) {
        match record.state {
            TransferState::Completed => {
                let n = self.completed as f64;
                self.avg_throughput_bps =
                    (self.avg_throughput_bps * n + record.throughput_bps) / (n + 1.0);
                self.max_throughput_bps = self.max_throughput_bps.max(record.throughput_bps);
                self.completed += 1;
            }
            TransferState::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
        self.total_bytes += record.bytes_acked;
    }
}

/// Everything status replies and the final statistics file report.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub commands_processed: u64,
    pub commands_failed: u64,
    pub commands_unknown: u64,
    pub transfers: TransferTotals,
    pub success_rate: f64,
    pub link: LinkStatsSnapshot,
    pub connected: bool,
    pub endpoint: Option<String>,
    pub active: Option<TransferRecord>,
    pub history: Vec<TransferRecord>,
}

struct StatusInner {
    commands: DispatchStats,
    totals: TransferTotals,
    link: LinkStatsSnapshot,
    connected: bool,
    endpoint: Option<String>,
    active: Option<TransferRecord>,
    history: VecDeque<TransferRecord>,
}

/// Shared, read-mostly view of the device state.
///
/// The supervisor writes it; command handlers read it.
#[derive(Clone)]
pub struct StatusBoard {
    started: Instant,
    inner: Arc<RwLock<StatusInner>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Arc::new(RwLock::new(StatusInner {
                commands: DispatchStats::default(),
                totals: TransferTotals::default(),
                link: LinkStatsSnapshot::default(),
                connected: false,
                endpoint: None,
                active: None,
                history: VecDeque::with_capacity(HISTORY_LIMIT),
            })),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&StatusInner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }

    fn write<T>(&self, f: impl FnOnce(&mut StatusInner) -> T) -> T {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_connected(&self, endpoint: Option<String>) {
        self.write(|s| {
            s.connected = endpoint.is_some();
            if endpoint.is_some() {
                s.endpoint = endpoint;
            }
        });
    }

    pub fn is_connected(&self) -> bool {
        self.read(|s| s.connected)
    }

    pub fn endpoint(&self) -> Option<String> {
        self.read(|s| s.endpoint.clone())
    }

    pub fn record_commands(&self, stats: DispatchStats) {
        self.write(|s| s.commands = stats);
    }

    pub fn commands_processed(&self) -> u64 {
        self.read(|s| s.commands.processed)
    }

    pub fn record_link(&self, link: LinkStatsSnapshot) {
        self.write(|s| s.link = link);
    }

    /// Marks a session as the active transfer.
    pub fn begin_transfer(&self, record: TransferRecord) {
        self.write(|s| s.active = Some(record));
    }

    /// Updates the active transfer's counters from a progress event.
    pub fn update_progress(&self, progress: &TransferProgress) {
        self.write(|s| {
            if let Some(active) = s.active.as_mut().filter(|a| a.id == progress.session_id) {
                active.state = progress.state;
                active.bytes_acked = progress.bytes_acked;
                active.chunk_index = progress.chunk_index;
                active.chunk_count = progress.chunk_count;
                active.throughput_bps = progress.throughput_bps;
            }
        });
    }

    /// Moves a finished session into the history.
    pub fn finish_transfer(&self, record: TransferRecord) {
        self.write(|s| {
            if s.active.as_ref().is_some_and(|a| a.id == record.id) {
                s.active = None;
            }
            s.totals.add(&record);
            if s.history.len() == HISTORY_LIMIT {
                s.history.pop_front();
            }
            s.history.push_back(record);
        });
    }

    pub fn active(&self) -> Option<TransferRecord> {
        self.read(|s| s.active.clone())
    }

    /// Finished sessions, oldest first.
    pub fn history(&self) -> Vec<TransferRecord> {
        self.read(|s| s.history.iter().cloned().collect())
    }

    pub fn totals(&self) -> TransferTotals {
        self.read(|s| s.totals.clone())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let uptime_secs = self.uptime().as_secs();
        self.read(|s| StatusSnapshot {
            uptime_secs,
            commands_processed: s.commands.processed,
            commands_failed: s.commands.failed,
            commands_unknown: s.commands.unknown,
            transfers: s.totals.clone(),
            success_rate: s.totals.success_rate(),
            link: s.link,
            connected: s.connected,
            endpoint: s.endpoint.clone(),
            active: s.active.clone(),
            history: s.history.iter().cloned().collect(),
        })
    }

    /// Writes the snapshot as pretty JSON to `dir/final_stats.json`.
    pub fn write_final_stats(&self, dir: &Path) -> Result<(), SupervisorError> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        std::fs::write(dir.join("final_stats.json"), json)?;
        Ok(())
    }
}
