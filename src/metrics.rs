//! Engine metrics for monitoring.
//!
//! Cheap atomic counters, snapshotted into a map for export. Per-device
//! transfer counters live on the device itself; this aggregates the
//! connection-scoped view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Connection-scoped engine counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Work items executed
    pub items_executed: AtomicU64,
    /// Work items executed with the cancel flag set
    pub items_cancelled: AtomicU64,
    /// Work-item callbacks that returned an error
    pub callback_failures: AtomicU64,
    /// Resync requests sent
    pub resync_requests: AtomicU64,
    /// Verify requests sent
    pub verify_requests: AtomicU64,
    /// Resync intervals answered in sync by checksum
    pub csum_hits: AtomicU64,
    /// Lower-device I/O errors observed
    pub io_errors: AtomicU64,
    /// Hard state escalations requested by the worker
    pub escalations: AtomicU64,
}

impl EngineMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let mut map = HashMap::new();
        map.insert("items_executed".to_string(), self.items_executed.load(Ordering::Relaxed));
        map.insert("items_cancelled".to_string(), self.items_cancelled.load(Ordering::Relaxed));
        map.insert(
            "callback_failures".to_string(),
            self.callback_failures.load(Ordering::Relaxed),
        );
        map.insert("resync_requests".to_string(), self.resync_requests.load(Ordering::Relaxed));
        map.insert("verify_requests".to_string(), self.verify_requests.load(Ordering::Relaxed));
        map.insert("csum_hits".to_string(), self.csum_hits.load(Ordering::Relaxed));
        map.insert("io_errors".to_string(), self.io_errors.load(Ordering::Relaxed));
        map.insert("escalations".to_string(), self.escalations.load(Ordering::Relaxed));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let metrics = EngineMetrics::new();
        EngineMetrics::inc(&metrics.items_executed);
        EngineMetrics::inc(&metrics.items_executed);
        EngineMetrics::inc(&metrics.io_errors);
        let snap = metrics.snapshot();
        assert_eq!(snap["items_executed"], 2);
        assert_eq!(snap["io_errors"], 1);
        assert_eq!(snap["escalations"], 0);
    }
}
