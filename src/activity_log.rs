//! Activity-log and resync-LRU collaborator interfaces.
//!
//! The activity log tracks currently-active write extents so a crash only
//! forces a resync of those extents. The resync LRU serializes resync
//! activity per extent against application I/O and provides the bandwidth
//! gate. Both are external; the engine consumes the contracts below. Null
//! implementations are provided for tests and volatile deployments.

use crate::error::Result;

/// On-disk activity log operations.
pub trait ActivityLog: Send + Sync {
    /// Mark the extent covering `[sector, sector + size_bytes)` active.
    fn begin_io(&self, sector: u64, size: u32) -> Result<()>;

    /// Complete the extent covering `[sector, sector + size_bytes)`.
    fn complete_io(&self, sector: u64, size: u32);
}

/// Resync-extent LRU operations.
pub trait ResyncLru: Send + Sync {
    /// Try to take the resync lock for the extent covering `sector`.
    /// Returns `false` when the extent is contended and the caller must
    /// defer (re-arm the resync timer).
    fn try_begin_io(&self, sector: u64) -> bool;

    /// Release the resync lock for the extent covering `sector`.
    fn complete_io(&self, sector: u64);

    /// Drop all extents. Returns `false` when entries are still referenced
    /// (replies in flight); the caller retries later.
    fn del_all(&self) -> bool;

    /// Cancel all pending resync extents, dropping references.
    fn cancel_all(&self);

    /// Bandwidth gate: `true` when background resync should yield to
    /// application I/O right now.
    fn should_slow_down(&self, sector: u64) -> bool;
}

/// Activity log that accepts everything. Used when no on-disk log is
/// configured.
pub struct NullActivityLog;

impl ActivityLog for NullActivityLog {
    fn begin_io(&self, _sector: u64, _size: u32) -> Result<()> {
        Ok(())
    }

    fn complete_io(&self, _sector: u64, _size: u32) {}
}

/// Resync LRU that never defers and always drains.
pub struct NullResyncLru;

impl ResyncLru for NullResyncLru {
    fn try_begin_io(&self, _sector: u64) -> bool {
        true
    }

    fn complete_io(&self, _sector: u64) {}

    fn del_all(&self) -> bool {
        true
    }

    fn cancel_all(&self) {}

    fn should_slow_down(&self, _sector: u64) -> bool {
        false
    }
}
