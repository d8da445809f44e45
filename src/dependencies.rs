//! Resync-after dependency graph.
//!
//! Devices may be chained with "resync after": a device only syncs once
//! every ancestor in its chain is done. The walks need stable states
//! across all devices, so they run under the registry's write lock; the
//! pause/resume cascade iterates to a fixpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::device::{Device, Registry};
use crate::error::{Error, Result};
use crate::state::{ConnState, DiskState, StateFlags};

/// True when `device` may sync now: no ancestor in its resync-after
/// chain is actively syncing or paused. Caller holds the registry lock.
pub(crate) fn may_sync_now_locked(
    devices: &BTreeMap<u32, Arc<Device>>,
    device: &Arc<Device>,
) -> bool {
    let mut odev = device.clone();
    loop {
        if odev.state().disk == DiskState::Diskless {
            return true;
        }
        let after = odev.sync_config.lock().resync_after;
        let Some(after) = after else {
            return true;
        };
        let Some(next) = devices.get(&after) else {
            return true;
        };
        odev = next.clone();
        let state = odev.state();
        if state.conn.is_syncing() || state.aftr_isp || state.peer_isp || state.user_isp {
            return false;
        }
    }
}

/// True when `device` may sync now.
pub fn may_sync_now(registry: &Registry, device: &Arc<Device>) -> bool {
    let devices = registry.write();
    may_sync_now_locked(&devices, device)
}

/// Pause resync on every device that may not sync now. Returns whether
/// any state changed. Caller holds the registry write lock.
pub(crate) fn pause_after_locked(devices: &BTreeMap<u32, Arc<Device>>) -> bool {
    let mut changed = false;
    for odev in devices.values() {
        let state = odev.state();
        if state.conn == ConnState::StandAlone && state.disk == DiskState::Diskless {
            continue;
        }
        if !may_sync_now_locked(devices, odev) && !state.aftr_isp {
            let mut ns = state;
            ns.aftr_isp = true;
            odev.set_state_locked(ns, StateFlags::HARD);
            changed = true;
        }
    }
    changed
}

/// Resume resync on every device that may sync now. Returns whether any
/// state changed. Caller holds the registry write lock.
pub(crate) fn resume_next_locked(devices: &BTreeMap<u32, Arc<Device>>) -> bool {
    let mut changed = false;
    for odev in devices.values() {
        let state = odev.state();
        if state.conn == ConnState::StandAlone && state.disk == DiskState::Diskless {
            continue;
        }
        if state.aftr_isp && may_sync_now_locked(devices, odev) {
            let mut ns = state;
            ns.aftr_isp = false;
            odev.set_state_locked(ns, StateFlags::HARD);
            changed = true;
        }
    }
    changed
}

/// Pause every device that must wait for `_origin` (or any other busy
/// ancestor).
pub fn suspend_other_sg(registry: &Registry, _origin: &Arc<Device>) {
    let devices = registry.write();
    pause_after_locked(&devices);
}

/// Resume every device whose dependencies drained.
pub fn resume_next_sg(registry: &Registry, _origin: &Arc<Device>) {
    let devices = registry.write();
    resume_next_locked(&devices);
}

/// Validate that pointing `device` at `na` keeps the chain acyclic.
/// Caller holds the registry write lock.
fn sync_after_error(
    devices: &BTreeMap<u32, Arc<Device>>,
    device: &Arc<Device>,
    na: Option<u32>,
) -> Result<()> {
    let Some(na) = na else {
        return Ok(());
    };
    let Some(start) = devices.get(&na) else {
        return Err(Error::SyncAfterUnknown { minor: na });
    };

    let mut odev = start.clone();
    loop {
        if Arc::ptr_eq(&odev, device) {
            return Err(Error::SyncAfterCycle { minor: na });
        }
        // Chain ends here, no cycle.
        let after = odev.sync_config.lock().resync_after;
        let Some(after) = after else {
            return Ok(());
        };
        let Some(next) = devices.get(&after) else {
            return Ok(());
        };
        odev = next.clone();
    }
}

/// Install a new resync-after dependency, rejecting cycles, then run the
/// pause/resume cascade to a fixpoint.
pub fn alter_resync_after(
    registry: &Registry,
    device: &Arc<Device>,
    na: Option<u32>,
) -> Result<()> {
    let devices = registry.write();
    sync_after_error(&devices, device, na)?;
    device.sync_config.lock().resync_after = na;
    debug!(minor = device.minor, after = ?na, "resync-after installed");
    loop {
        let paused = pause_after_locked(&devices);
        let resumed = resume_next_locked(&devices);
        if !paused && !resumed {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_log::{NullActivityLog, NullResyncLru};
    use crate::bitmap::MemoryBitmap;
    use crate::config::SyncConfig;
    use crate::device::NullLowerDevice;
    use crate::state::DeviceState;

    fn attach(registry: &Registry, minor: u32) -> Arc<Device> {
        let device = Device::new(
            minor,
            1 << 16,
            SyncConfig::default(),
            Arc::new(MemoryBitmap::new(1 << 16)),
            Arc::new(NullActivityLog),
            Arc::new(NullResyncLru),
            Arc::new(NullLowerDevice),
        );
        let mut ns = DeviceState::standalone();
        ns.conn = ConnState::Connected;
        ns.disk = DiskState::UpToDate;
        ns.pdsk = DiskState::UpToDate;
        registry.set_state(&device, ns, StateFlags::HARD);
        registry.insert(device.clone());
        device
    }

    #[test]
    fn test_cycle_rejected_chain_unchanged() {
        let registry = Registry::new();
        let a = attach(&registry, 0);
        let b = attach(&registry, 1);
        let c = attach(&registry, 2);

        // A after B, B after C
        alter_resync_after(&registry, &a, Some(1)).unwrap();
        alter_resync_after(&registry, &b, Some(2)).unwrap();

        // C after A closes the loop
        let err = alter_resync_after(&registry, &c, Some(0)).unwrap_err();
        assert!(matches!(err, Error::SyncAfterCycle { minor: 0 }));
        assert_eq!(c.sync_config.lock().resync_after, None);

        // self-reference is the smallest cycle
        let err = alter_resync_after(&registry, &a, Some(0)).unwrap_err();
        assert!(matches!(err, Error::SyncAfterCycle { .. }));
        assert_eq!(a.sync_config.lock().resync_after, Some(1));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let registry = Registry::new();
        let a = attach(&registry, 0);
        let err = alter_resync_after(&registry, &a, Some(99)).unwrap_err();
        assert!(matches!(err, Error::SyncAfterUnknown { minor: 99 }));
    }

    #[test]
    fn test_pause_cascade_on_busy_ancestor() {
        let registry = Registry::new();
        let a = attach(&registry, 0);
        let b = attach(&registry, 1);

        // B syncs after A; A is busy syncing.
        let mut ns = a.state();
        ns.conn = ConnState::SyncTarget;
        registry.set_state(&a, ns, StateFlags::HARD);
        alter_resync_after(&registry, &b, Some(0)).unwrap();

        assert!(b.state().aftr_isp);
        assert!(!a.state().aftr_isp);

        // A finishes: B resumes.
        let mut ns = a.state();
        ns.conn = ConnState::Connected;
        registry.set_state(&a, ns, StateFlags::HARD);
        resume_next_sg(&registry, &a);
        assert!(!b.state().aftr_isp);
    }

    #[test]
    fn test_may_sync_now_transitive() {
        let registry = Registry::new();
        let a = attach(&registry, 0);
        let b = attach(&registry, 1);
        let c = attach(&registry, 2);
        alter_resync_after(&registry, &c, Some(1)).unwrap();
        alter_resync_after(&registry, &b, Some(0)).unwrap();

        assert!(may_sync_now(&registry, &c));

        let mut ns = a.state();
        ns.conn = ConnState::SyncSource;
        registry.set_state(&a, ns, StateFlags::HARD);
        // A busy pauses B (ancestor syncing) and C (ancestor paused).
        suspend_other_sg(&registry, &a);
        suspend_other_sg(&registry, &a);
        assert!(b.state().aftr_isp);
        assert!(c.state().aftr_isp);
        assert!(!may_sync_now(&registry, &b));
        assert!(!may_sync_now(&registry, &c));
    }
}
