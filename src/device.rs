//! Device context: the unit of replication.
//!
//! A device owns its dirty bitmap, resync bookkeeping, verify cursors,
//! generation UUIDs, and transfer counters. Devices live in a [`Registry`]
//! whose reader/writer lock implements the global state discipline: every
//! single-device state transition holds the lock for read, and the
//! dependency-graph walks (which need stable states across all devices)
//! hold it for write.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::activity_log::{ActivityLog, ResyncLru};
use crate::bitmap::SyncBitmap;
use crate::config::{OnIoError, SyncConfig};
use crate::error::Result;
use crate::fifo::Fifo;
use crate::requests::{PeerRequest, Request};
use crate::state::{DeviceState, DiskState, StateFlags};

/// Number of sliding progress marks kept per resync run.
pub const SYNC_MARKS: usize = 8;
/// Seconds between progress-mark advances.
pub const SYNC_MARK_STEP_SECS: u64 = 3;

bitflags! {
    /// Per-device operational flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// The before-resync handlers already ran for the pending start
        const RS_H_DONE = 1 << 0;
        /// A resync tick is already queued on the worker
        const RESYNC_QUEUED = 1 << 1;
        /// Leave Ahead congestion mode into SyncSource when drained
        const AHEAD_TO_SYNC_SOURCE = 1 << 2;
    }
}

/// Generation UUID slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidIndex {
    /// Current data generation
    Current = 0,
    /// Generation the bitmap tracks changes against
    Bitmap = 1,
    /// History slot 1
    History1 = 2,
    /// History slot 2
    History2 = 3,
}

/// The four generation UUID slots of a device (or of the peer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UuidSet {
    slots: [u64; 4],
}

impl UuidSet {
    /// Read one slot.
    pub fn get(&self, idx: UuidIndex) -> u64 {
        self.slots[idx as usize]
    }

    /// Write one slot.
    pub fn set(&mut self, idx: UuidIndex, value: u64) {
        self.slots[idx as usize] = value;
    }
}

/// Controller plan state, guarded by the device sequence lock.
pub struct RateState {
    /// Planned corrections, one slot per future tick
    pub fifo: Fifo,
    /// Sectors requested and not yet answered
    pub rs_in_flight: i64,
    /// Sum of corrections already planned into the fifo
    pub rs_planed: i64,
}

/// Accumulated out-of-sync range found by online verify.
#[derive(Debug, Clone, Copy, Default)]
pub struct OvOutOfSync {
    /// First sector of the accumulated range
    pub start: u64,
    /// Size in sectors
    pub size: u64,
}

struct RsRun {
    start: Instant,
    marks: [(u64, Instant); SYNC_MARKS],
    mark_idx: usize,
}

/// Lower block device. Submission is asynchronous: completion comes back
/// through the endio dispatch.
pub trait LowerDevice: Send + Sync {
    /// Submit a peer request (resync or verify read, replicated write).
    fn submit_peer_request(&self, req: &Arc<PeerRequest>, write: bool) -> Result<()>;

    /// Re-submit a primary request to the backing device.
    fn submit_request(&self, req: &Arc<Request>) -> Result<()>;
}

/// Lower device that accepts everything and never completes. Tests drive
/// completions through the endio handlers directly.
pub struct NullLowerDevice;

impl LowerDevice for NullLowerDevice {
    fn submit_peer_request(&self, _req: &Arc<PeerRequest>, _write: bool) -> Result<()> {
        Ok(())
    }

    fn submit_request(&self, _req: &Arc<Request>) -> Result<()> {
        Ok(())
    }
}

/// One replicated device.
pub struct Device {
    /// Minor number, the device's identity
    pub minor: u32,
    /// Capacity in 512-byte sectors
    pub capacity_sectors: u64,
    /// Resync settings
    pub sync_config: Mutex<SyncConfig>,

    state: Mutex<DeviceState>,
    /// Serializes user-initiated state changes against the worker; the
    /// worker only try-locks this and defers via a timer.
    pub state_mutex: Mutex<()>,

    ldev_ref: AtomicI64,

    /// Total bits to sync in the current run
    pub rs_total: AtomicU64,
    /// Failed bits in the current run
    pub rs_failed: AtomicU64,
    /// Time spent paused, in milliseconds
    pub rs_paused_ms: AtomicU64,
    /// Bits satisfied by equal checksums
    pub rs_same_csum: AtomicU64,
    /// Sectors whose replies arrived since the last controller tick
    pub rs_sect_in: AtomicU64,
    /// Sectors submitted to the backing device for resync reads
    pub rs_sect_ev: AtomicU64,
    /// Outstanding resync replies
    pub rs_pending: AtomicI64,
    /// Outstanding acks we owe the peer
    pub unacked: AtomicI64,
    /// Effective sync rate, for reporting
    pub c_sync_rate: AtomicU64,

    rate: Mutex<RateState>,

    /// Next bitmap bit the resync sweep examines
    pub bm_resync_fo: AtomicU64,

    /// Online-verify sweep position, in sectors
    pub ov_position: AtomicU64,
    /// Verify replies still outstanding
    pub ov_left: AtomicU64,
    /// Sector the current verify run started at
    pub ov_start_sector: AtomicU64,
    ov_oos: Mutex<OvOutOfSync>,

    rs_run: Mutex<RsRun>,
    flags: AtomicU32,

    /// Sectors sent to the peer
    pub send_cnt: AtomicU64,
    /// Sectors read on behalf of the peer
    pub read_cnt: AtomicU64,
    /// Sectors written on behalf of the peer
    pub writ_cnt: AtomicU64,
    /// Lower-device errors observed
    pub disk_failures: AtomicU64,
    /// Meta-data sync requests issued
    pub md_syncs: AtomicU64,

    /// Our generation UUIDs
    pub uuids: Mutex<UuidSet>,
    /// The peer's generation UUIDs, once received
    pub p_uuid: Mutex<Option<UuidSet>>,

    /// Dirty-block bitmap
    pub bitmap: Arc<dyn SyncBitmap>,
    /// Activity log
    pub act_log: Arc<dyn ActivityLog>,
    /// Resync-extent LRU
    pub rs_lru: Arc<dyn ResyncLru>,
    /// Backing block device
    pub lower: Arc<dyn LowerDevice>,
}

impl Device {
    /// Create a device in standalone state.
    pub fn new(
        minor: u32,
        capacity_sectors: u64,
        sync_config: SyncConfig,
        bitmap: Arc<dyn SyncBitmap>,
        act_log: Arc<dyn ActivityLog>,
        rs_lru: Arc<dyn ResyncLru>,
        lower: Arc<dyn LowerDevice>,
    ) -> Arc<Self> {
        let fifo_size = sync_config.c_plan_ahead as usize;
        Arc::new(Self {
            minor,
            capacity_sectors,
            sync_config: Mutex::new(sync_config),
            state: Mutex::new(DeviceState::standalone()),
            state_mutex: Mutex::new(()),
            ldev_ref: AtomicI64::new(0),
            rs_total: AtomicU64::new(0),
            rs_failed: AtomicU64::new(0),
            rs_paused_ms: AtomicU64::new(0),
            rs_same_csum: AtomicU64::new(0),
            rs_sect_in: AtomicU64::new(0),
            rs_sect_ev: AtomicU64::new(0),
            rs_pending: AtomicI64::new(0),
            unacked: AtomicI64::new(0),
            c_sync_rate: AtomicU64::new(0),
            rate: Mutex::new(RateState {
                fifo: Fifo::new(fifo_size),
                rs_in_flight: 0,
                rs_planed: 0,
            }),
            bm_resync_fo: AtomicU64::new(0),
            ov_position: AtomicU64::new(0),
            ov_left: AtomicU64::new(0),
            ov_start_sector: AtomicU64::new(0),
            ov_oos: Mutex::new(OvOutOfSync::default()),
            rs_run: Mutex::new(RsRun {
                start: Instant::now(),
                marks: [(0, Instant::now()); SYNC_MARKS],
                mark_idx: 0,
            }),
            flags: AtomicU32::new(0),
            send_cnt: AtomicU64::new(0),
            read_cnt: AtomicU64::new(0),
            writ_cnt: AtomicU64::new(0),
            disk_failures: AtomicU64::new(0),
            md_syncs: AtomicU64::new(0),
            uuids: Mutex::new(UuidSet::default()),
            p_uuid: Mutex::new(None),
            bitmap,
            act_log,
            rs_lru,
            lower,
        })
    }

    /// Snapshot the replication state.
    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Apply a state transition. The caller must hold the registry lock
    /// (read for single-device transitions, write inside dependency
    /// walks).
    pub(crate) fn set_state_locked(&self, ns: DeviceState, flags: StateFlags) {
        let mut state = self.state.lock();
        let os = *state;
        if os == ns {
            return;
        }
        *state = ns;
        drop(state);
        if flags.contains(StateFlags::VERBOSE) {
            debug!(
                minor = self.minor,
                conn = ?ns.conn,
                disk = ?ns.disk,
                pdsk = ?ns.pdsk,
                "state change"
            );
        }
    }

    /// Take a reference on the backing device if its disk state is at
    /// least `min`. Pairs with [`Device::put_ldev`].
    pub fn get_ldev_if_state(&self, min: DiskState) -> bool {
        let state = self.state.lock();
        if state.disk >= min {
            self.ldev_ref.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Take a reference on the backing device if it is usable.
    pub fn get_ldev(&self) -> bool {
        self.get_ldev_if_state(DiskState::Inconsistent)
    }

    /// Drop a backing-device reference.
    pub fn put_ldev(&self) {
        let prev = self.ldev_ref.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "ldev refcount underflow");
    }

    /// Set device flags.
    pub fn set_flags(&self, flags: DeviceFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear device flags. Returns the previous snapshot.
    pub fn clear_flags(&self, flags: DeviceFlags) -> DeviceFlags {
        let prev = self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        DeviceFlags::from_bits_truncate(prev)
    }

    /// Atomically set flags, reporting whether all of them were already
    /// set.
    pub fn test_and_set_flags(&self, flags: DeviceFlags) -> bool {
        let prev = self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        DeviceFlags::from_bits_truncate(prev).contains(flags)
    }

    /// Current device flags.
    pub fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Lock the controller plan state (the device sequence lock).
    pub fn rate(&self) -> MutexGuard<'_, RateState> {
        self.rate.lock()
    }

    /// Account one more outstanding resync reply.
    pub fn inc_rs_pending(&self) {
        self.rs_pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Account one resync reply as settled.
    pub fn dec_rs_pending(&self) {
        self.rs_pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Account one more ack owed to the peer.
    pub fn inc_unacked(&self) {
        self.unacked.fetch_add(1, Ordering::AcqRel);
    }

    /// Account one ack as sent.
    pub fn dec_unacked(&self) {
        self.unacked.fetch_sub(1, Ordering::AcqRel);
    }

    /// Lock the verify out-of-sync accumulator.
    pub fn ov_oos(&self) -> MutexGuard<'_, OvOutOfSync> {
        self.ov_oos.lock()
    }

    /// Largest request size the scheduler may build.
    pub fn max_bio_size(&self) -> u32 {
        self.sync_config.lock().max_bio_size
    }

    /// Record an I/O error from the backing device; with the detach
    /// policy the disk is demoted to Failed.
    pub fn chk_io_error(&self, registry: &Registry) {
        self.disk_failures.fetch_add(1, Ordering::Relaxed);
        let policy = self.sync_config.lock().on_io_error;
        match policy {
            OnIoError::PassOn => {
                warn!(minor = self.minor, "lower device error, passing on");
            }
            OnIoError::Detach => {
                warn!(minor = self.minor, "lower device error, detaching");
                let mut ns = self.state();
                ns.disk = DiskState::Failed;
                registry.set_state(self, ns, StateFlags::HARD);
            }
        }
    }

    /// Start a new progress-mark window for a resync run of `total` bits.
    pub fn reset_rs_marks(&self, total: u64) {
        let mut run = self.rs_run.lock();
        let now = Instant::now();
        run.start = now;
        run.mark_idx = 0;
        for mark in run.marks.iter_mut() {
            *mark = (total, now);
        }
    }

    /// Advance the sliding progress marks when a step elapsed.
    pub fn advance_rs_marks(&self, left: u64) {
        let mut run = self.rs_run.lock();
        let now = Instant::now();
        let idx = run.mark_idx;
        if now.duration_since(run.marks[idx].1).as_secs() >= SYNC_MARK_STEP_SECS {
            let next = (idx + 1) % SYNC_MARKS;
            run.mark_idx = next;
            run.marks[next] = (left, now);
        }
    }

    /// Seconds since the resync run started.
    pub fn rs_elapsed_secs(&self) -> u64 {
        self.rs_run.lock().start.elapsed().as_secs()
    }

    /// Schedule a meta-data sync. The meta-data layout is external; the
    /// engine only records that one is due.
    pub fn md_sync(&self) {
        self.md_syncs.fetch_add(1, Ordering::Relaxed);
        debug!(minor = self.minor, "meta-data sync requested");
    }

    /// Reset counters after the worker shuts a connection down.
    pub fn cleanup(&self) {
        self.rs_total.store(0, Ordering::Relaxed);
        self.rs_failed.store(0, Ordering::Relaxed);
        self.rs_paused_ms.store(0, Ordering::Relaxed);
        self.rs_same_csum.store(0, Ordering::Relaxed);
        self.rs_sect_in.store(0, Ordering::Relaxed);
        self.rs_sect_ev.store(0, Ordering::Relaxed);
        self.rs_pending.store(0, Ordering::Relaxed);
        self.unacked.store(0, Ordering::Relaxed);
        self.bm_resync_fo.store(0, Ordering::Relaxed);
        self.ov_left.store(0, Ordering::Relaxed);
        let mut rate = self.rate.lock();
        rate.rs_in_flight = 0;
        rate.rs_planed = 0;
        rate.fifo.set_all(0);
    }
}

/// Directory of devices with the global state-lock discipline.
pub struct Registry {
    devices: RwLock<BTreeMap<u32, Arc<Device>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a device.
    pub fn insert(&self, device: Arc<Device>) {
        self.devices.write().insert(device.minor, device);
    }

    /// Remove a device.
    pub fn remove(&self, minor: u32) -> Option<Arc<Device>> {
        self.devices.write().remove(&minor)
    }

    /// Look a device up by minor.
    pub fn get(&self, minor: u32) -> Option<Arc<Device>> {
        self.devices.read().get(&minor).cloned()
    }

    /// Take the state lock for read (single-device transition scope).
    pub fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u32, Arc<Device>>> {
        self.devices.read()
    }

    /// Take the state lock for write (dependency-walk scope).
    pub fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u32, Arc<Device>>> {
        self.devices.write()
    }

    /// Apply a single-device state transition under the read lock.
    pub fn set_state(&self, device: &Device, ns: DeviceState, flags: StateFlags) {
        let _guard = self.devices.read();
        device.set_state_locked(ns, flags);
    }
}
