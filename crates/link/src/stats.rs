use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Traffic counters shared between the reader task and the write guard.
#[derive(Debug)]
pub struct LinkStats {
    started: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    lines_sent: AtomicU64,
    lines_received: AtomicU64,
    lines_dropped: AtomicU64,
    /// Milliseconds since `started` at the last byte in either direction.
    last_activity_ms: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub lines_sent: u64,
    pub lines_received: u64,
    pub lines_dropped: u64,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            lines_sent: AtomicU64::new(0),
            lines_received: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, bytes: usize, is_line: bool) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if is_line {
            self.lines_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_line(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_line(&self) {
        self.lines_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Time since the last byte crossed the link in either direction.
    pub fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            lines_sent: self.lines_sent.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            lines_dropped: self.lines_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = LinkStats::new();
        stats.record_sent(10, true);
        stats.record_sent(256, false);
        stats.record_received(5);
        stats.record_line();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 266);
        assert_eq!(snap.lines_sent, 1);
        assert_eq!(snap.bytes_received, 5);
        assert_eq!(snap.lines_received, 1);
        assert_eq!(snap.lines_dropped, 0);
    }

    #[test]
    fn activity_resets_idle_time() {
        let stats = LinkStats::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(stats.idle_for() >= Duration::from_millis(20));
        stats.record_received(1);
        assert!(stats.idle_for() < Duration::from_millis(20));
    }
}
