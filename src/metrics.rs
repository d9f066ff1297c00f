//! Process-wide metrics registry
//!
//! The only state shared across actors. Plain atomic counters; everything
//! else in the process is owned by exactly one actor and reached through
//! its mailbox.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared handle to the metrics registry.
pub type Metrics = Arc<MetricsInner>;

/// Atomic counters updated from the hot paths.
#[derive(Debug, Default)]
pub struct MetricsInner {
    /// Connections accepted since startup
    pub conns_total: AtomicU64,
    /// Currently open connections
    pub conns_current: AtomicU64,
    /// Frames delivered into reader queues
    pub frames_relayed: AtomicU64,
    /// Frames dropped on full reader queues
    pub frames_dropped: AtomicU64,
    /// Readers ejected for exceeding the drop threshold
    pub readers_ejected: AtomicU64,
    /// Segments produced by all segmenters
    pub segments_produced: AtomicU64,
    /// Paths with an active publisher
    pub paths_publishing: AtomicU64,
}

/// Create a fresh registry.
pub fn new() -> Metrics {
    Arc::new(MetricsInner::default())
}

impl MetricsInner {
    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self, counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    /// Read all counters into a plain snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            conns_total: self.conns_total.load(Ordering::Relaxed),
            conns_current: self.conns_current.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            readers_ejected: self.readers_ejected.load(Ordering::Relaxed),
            segments_produced: self.segments_produced.load(Ordering::Relaxed),
            paths_publishing: self.paths_publishing.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub conns_total: u64,
    pub conns_current: u64,
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub readers_ejected: u64,
    pub segments_produced: u64,
    pub paths_publishing: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let m = new();
        m.inc(&m.conns_total);
        m.inc(&m.conns_total);
        m.inc(&m.conns_current);
        m.dec(&m.conns_current);
        m.inc(&m.frames_dropped);

        let snap = m.snapshot();
        assert_eq!(snap.conns_total, 2);
        assert_eq!(snap.conns_current, 0);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.frames_relayed, 0);
    }
}
