//! Resync scheduler: bitmap sweep, request production, run lifecycle.
//!
//! The sweep walks the dirty bitmap from the resync cursor, coalescing
//! adjacent dirty blocks into larger aligned requests, deferring under
//! back-pressure or extent contention, and either requesting the block
//! from the peer or (with a checksum transform and a capable peer)
//! reading it locally first to try a digest-only exchange. The online
//! verify sweep is the cursor-driven analog without coalescing.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::bitmap::{
    bit_to_sector, sector_to_bit, BM_BITS_PER_EXT_MASK, BM_BLOCK_SHIFT, BM_BLOCK_SIZE,
    BM_SECT_PER_BIT, END_OF_BITMAP,
};
use crate::connection::Connection;
use crate::controller::{self, SLEEP_TIME};
use crate::dependencies;
use crate::device::{Device, DeviceFlags, UuidIndex};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::protocol::MessageType;
use crate::requests::{PeerWork, ID_SYNCER};
use crate::state::{ConnState, DiskState, StateFlags};
use crate::work::WorkItem;

/// Minimum protocol version with checksum-based resync.
const PRO_VERSION_CSUM: u32 = 89;
/// Below this version the sync UUID is exchanged from the worker.
const PRO_VERSION_SYNC_UUID_FROM_WORKER: u32 = 96;
/// Below this version an empty resync finishes inline.
const PRO_VERSION_EXPLICIT_FINISH: u32 = 95;

/// One resync tick: produce up to the controller's budget of resync
/// requests, then re-arm the timer.
pub fn make_resync_request(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    cancel: bool,
) -> Result<()> {
    if cancel {
        return Ok(());
    }

    if device.rs_total.load(Ordering::Acquire) == 0 {
        // Empty resync.
        resync_finished(conn, device);
        return Ok(());
    }

    if !device.get_ldev() {
        // Continuing a resync with a broken disk makes no sense.
        error!(minor = device.minor, "disk broke down during resync");
        return Ok(());
    }

    let max_bio_size = device.max_bio_size();
    let capacity = device.capacity_sectors;
    let number = controller::rs_number_requests(device);

    let csum_capable = conn.agreed_pro_version.load(Ordering::Acquire) >= PRO_VERSION_CSUM
        && device.sync_config.lock().csums_alg.is_some();

    let mut i: u64 = 0;
    let mut defer = number == 0;

    'sweep: while i < number {
        // Stop producing when half of the send buffer is queued.
        let stats = conn.transport.stats();
        if stats.send_buffer_used > stats.send_buffer_size / 2 {
            defer = true;
            break 'sweep;
        }

        // Find the next dirty bit, skipping bits that went clean while
        // we were not looking.
        let (mut bit, sector) = loop {
            let bit = device
                .bitmap
                .find_next(device.bm_resync_fo.load(Ordering::Acquire));
            if bit == END_OF_BITMAP {
                device
                    .bm_resync_fo
                    .store(device.bitmap.bits(), Ordering::Release);
                device.put_ldev();
                return Ok(());
            }
            let sector = bit_to_sector(bit);

            if device.rs_lru.should_slow_down(sector) || !device.rs_lru.try_begin_io(sector) {
                device.bm_resync_fo.store(bit, Ordering::Release);
                defer = true;
                break 'sweep;
            }
            device.bm_resync_fo.store(bit + 1, Ordering::Release);

            if device.bitmap.test_bit(bit) == 0 {
                device.rs_lru.complete_io(sector);
                continue;
            }
            break (bit, sector);
        };

        let mut size = BM_BLOCK_SIZE;
        let rollback_i = i;

        // Coalesce adjacent dirty bits up to the request-size limit.
        // Bigger requests are kept aligned so all stripe sizes of
        // software RAIDs below stay happy.
        if max_bio_size > BM_BLOCK_SIZE {
            let mut align: u32 = 1;
            loop {
                if size + BM_BLOCK_SIZE > max_bio_size {
                    break;
                }
                if sector & ((1u64 << (align + 3)) - 1) != 0 {
                    break;
                }
                // Never cross a bitmap-extent boundary.
                if (bit + 1) & BM_BITS_PER_EXT_MASK == 0 {
                    break;
                }
                // test_bit is tri-state; only a definite 1 may grow the
                // request.
                if device.bitmap.test_bit(bit + 1) != 1 {
                    break;
                }
                bit += 1;
                size += BM_BLOCK_SIZE;
                if (BM_BLOCK_SIZE << align) <= size {
                    align += 1;
                }
                i += 1;
            }
            if size > BM_BLOCK_SIZE {
                device.bm_resync_fo.store(bit + 1, Ordering::Release);
            }
        }

        // Adjust the very last request for oddly-sized devices.
        if sector + u64::from(size >> 9) > capacity {
            size = ((capacity - sector) << 9) as u32;
        }

        if csum_capable {
            match read_for_csum(conn, device, sector, size) {
                Err(Error::Io { .. }) => {
                    device.put_ldev();
                    return Err(Error::io("checksum read submission failed"));
                }
                Err(_) => {
                    // Allocation failed or the extent went busy: roll
                    // back and retry this window on the next tick.
                    device.rs_lru.complete_io(sector);
                    device
                        .bm_resync_fo
                        .store(sector_to_bit(sector), Ordering::Release);
                    i = rollback_i;
                    defer = true;
                    break 'sweep;
                }
                Ok(()) => {}
            }
        } else {
            device.inc_rs_pending();
            if let Err(e) =
                conn.send_drequest(MessageType::RsDataRequest, sector, size, ID_SYNCER)
            {
                error!(minor = device.minor, "sending resync request failed, aborting");
                device.dec_rs_pending();
                device.put_ldev();
                return Err(e);
            }
            EngineMetrics::inc(&conn.metrics.resync_requests);
        }

        i += 1;
    }

    if !defer && device.bm_resync_fo.load(Ordering::Acquire) >= device.bitmap.bits() {
        // The last request was sent; the run ends once the final reply
        // clears the last bit. Until then resync work is inactive.
        device.put_ldev();
        return Ok(());
    }

    device.rate().rs_in_flight += (i << (BM_BLOCK_SHIFT - 9)) as i64;
    conn.arm_resync_timer(device, Duration::from_millis(SLEEP_TIME));
    device.put_ldev();
    Ok(())
}

/// Read a block locally so its digest can be offered instead of a full
/// transfer. `WouldBlock` means "defer and retry this window".
pub fn read_for_csum(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    sector: u64,
    size: u32,
) -> Result<()> {
    if !device.get_ldev() {
        return Err(Error::io("no local disk for checksum read"));
    }

    if device.rs_lru.should_slow_down(sector) {
        device.put_ldev();
        return Err(Error::would_block("resync paced down"));
    }

    // Background resync tolerates allocation pressure; it is simply
    // rescheduled for later.
    let Some(peer_req) = conn.allocator.alloc(device.minor, ID_SYNCER, sector, size) else {
        device.put_ldev();
        return Err(Error::would_block("peer request allocation failed"));
    };
    *peer_req.work.lock() = PeerWork::SendCsum;
    peer_req.pending_bios.store(1, Ordering::Release);

    conn.ee().read_ee.push_back(peer_req.clone());

    device
        .rs_sect_ev
        .fetch_add(u64::from(size) >> 9, Ordering::Relaxed);
    if device.lower.submit_peer_request(&peer_req, false).is_ok() {
        // The backing-device reference travels with the read and is
        // dropped by the completion path.
        return Ok(());
    }

    // Retry helps against allocation pressure below; if the lower layer
    // is truly broken the next attempt escalates through an I/O error.
    {
        let mut ee = conn.ee();
        crate::connection::ee_remove(&mut ee.read_ee, &peer_req);
    }
    conn.allocator.free(peer_req);
    device.put_ldev();
    Err(Error::would_block("lower device refused the read"))
}

/// One verify tick: request the next windows of the verify sweep.
pub fn make_ov_request(conn: &Arc<Connection>, device: &Arc<Device>, cancel: bool) -> Result<()> {
    if cancel {
        return Ok(());
    }

    let number = controller::rs_number_requests(device);
    let capacity = device.capacity_sectors;
    let mut sector = device.ov_position.load(Ordering::Acquire);

    let mut i: u64 = 0;
    while i < number {
        if sector >= capacity {
            return Ok(());
        }

        if device.rs_lru.should_slow_down(sector) || !device.rs_lru.try_begin_io(sector) {
            break;
        }

        let mut size = BM_BLOCK_SIZE;
        if sector + u64::from(size >> 9) > capacity {
            size = ((capacity - sector) << 9) as u32;
        }

        device.inc_rs_pending();
        if conn.send_ov_request(sector, size).is_err() {
            device.dec_rs_pending();
            return Ok(());
        }
        EngineMetrics::inc(&conn.metrics.verify_requests);
        sector += BM_SECT_PER_BIT;
        i += 1;
    }
    device.ov_position.store(sector, Ordering::Release);

    device.rate().rs_in_flight += (i << (BM_BLOCK_SHIFT - 9)) as i64;
    conn.arm_resync_timer(device, Duration::from_millis(SLEEP_TIME));
    Ok(())
}

/// Record failed resync bits.
pub fn rs_failed_io(device: &Arc<Device>, _sector: u64, size: u32) {
    device
        .rs_failed
        .fetch_add(u64::from(size) >> BM_BLOCK_SHIFT, Ordering::Relaxed);
}

/// Mark an interval clean after a digest match or a completed write.
pub fn set_in_sync(device: &Arc<Device>, sector: u64, size: u32) {
    device.bitmap.set_in_sync(sector, size);
}

/// Accumulate a failed verify interval, merging adjacent findings.
pub fn ov_out_of_sync_found(device: &Arc<Device>, sector: u64, size: u32) {
    let mut oos = device.ov_oos();
    if oos.size > 0 && oos.start + oos.size == sector {
        oos.size += u64::from(size) >> 9;
    } else {
        oos.start = sector;
        oos.size = u64::from(size) >> 9;
    }
    drop(oos);
    device.bitmap.set_out_of_sync(sector, size);
}

/// Report and reset the accumulated out-of-sync range.
pub fn ov_out_of_sync_print(device: &Arc<Device>) {
    let mut oos = device.ov_oos();
    if oos.size > 0 {
        warn!(
            minor = device.minor,
            start = oos.start,
            sectors = oos.size,
            "out of sync found by online verify"
        );
        oos.size = 0;
    }
}

/// Finish a resync or verify run: drain the resync LRU, report
/// throughput, update generation UUIDs, transition back to Connected,
/// and run the outcome handler.
pub fn resync_finished(conn: &Arc<Connection>, device: &Arc<Device>) {
    // All resync-LRU entries must go: future writes may set bits in the
    // bitmap, and stale extents would be wrong. If replies are still
    // lingering on the queue, retry shortly.
    if !device.rs_lru.del_all() {
        std::thread::sleep(Duration::from_millis(100));
        conn.queue.queue(WorkItem::ResyncFinished {
            device: device.clone(),
        });
        return;
    }

    let paused_secs = device.rs_paused_ms.load(Ordering::Acquire) / 1000;
    let dt = device
        .rs_elapsed_secs()
        .saturating_sub(paused_secs)
        .max(1);
    let db = device.rs_total.load(Ordering::Acquire);
    let dbdt = (db / dt) << (BM_BLOCK_SHIFT - 10);

    let mut verify_done = false;
    let mut khelper_cmd: Option<&'static str> = None;

    if device.get_ldev() {
        conn.ping_peer(device);

        let os = device.state();
        verify_done = matches!(os.conn, ConnState::VerifyS | ConnState::VerifyT);

        // Guards against multiple calls under application I/O and
        // against connection loss just before we got here.
        if os.conn > ConnState::Connected {
            let mut ns = os;
            ns.conn = ConnState::Connected;

            info!(
                minor = device.minor,
                kind = if verify_done { "online verify" } else { "resync" },
                seconds = dt + paused_secs,
                paused = paused_secs,
                kib_per_sec = dbdt,
                "done"
            );

            let n_oos = device.bitmap.total_weight();

            if verify_done {
                if n_oos > 0 {
                    warn!(
                        minor = device.minor,
                        blocks = n_oos,
                        "online verify found out-of-sync blocks"
                    );
                    khelper_cmd = Some("out-of-sync");
                }
            } else {
                debug_assert_eq!(n_oos, device.rs_failed.load(Ordering::Acquire));

                if matches!(os.conn, ConnState::SyncTarget | ConnState::PausedSyncT) {
                    khelper_cmd = Some("after-resync-target");
                }

                if device.sync_config.lock().csums_alg.is_some() && db > 0 {
                    let s = device.rs_same_csum.load(Ordering::Acquire);
                    let ratio = if db == 0 {
                        0
                    } else if db < 100_000 {
                        s * 100 / db
                    } else {
                        s / (db / 100)
                    };
                    info!(
                        minor = device.minor,
                        percent_equal = ratio,
                        eliminated_kib = s << (BM_BLOCK_SHIFT - 10),
                        transferred_kib = (db - s) << (BM_BLOCK_SHIFT - 10),
                        "checksum resync statistics"
                    );
                }
            }

            let rs_failed = device.rs_failed.load(Ordering::Acquire);
            if rs_failed > 0 {
                info!(minor = device.minor, failed = rs_failed, "failed blocks");

                if matches!(os.conn, ConnState::SyncTarget | ConnState::PausedSyncT) {
                    ns.disk = DiskState::Inconsistent;
                    ns.pdsk = DiskState::UpToDate;
                } else {
                    ns.disk = DiskState::UpToDate;
                    ns.pdsk = DiskState::Inconsistent;
                }
            } else {
                ns.disk = DiskState::UpToDate;
                ns.pdsk = DiskState::UpToDate;

                if matches!(os.conn, ConnState::SyncTarget | ConnState::PausedSyncT) {
                    let p_uuid = *device.p_uuid.lock();
                    if let Some(p_uuid) = p_uuid {
                        // Adopt the peer's history, keep our previous
                        // current generation as the bitmap generation.
                        let mut uuids = device.uuids.lock();
                        let our_current = uuids.get(UuidIndex::Current);
                        for idx in [UuidIndex::Bitmap, UuidIndex::History1, UuidIndex::History2] {
                            uuids.set(idx, p_uuid.get(idx));
                        }
                        uuids.set(UuidIndex::Bitmap, our_current);
                        uuids.set(UuidIndex::Current, p_uuid.get(UuidIndex::Current));
                    } else {
                        error!(minor = device.minor, "peer UUIDs missing at resync end");
                    }
                }

                if !verify_done {
                    // Both UUID sets are equal now; remember that for
                    // the peer as well. Verify runs leave UUIDs alone.
                    let mut uuids = device.uuids.lock();
                    uuids.set(UuidIndex::Bitmap, 0);
                    debug!(minor = device.minor, "updated UUIDs after resync");
                    let mut p_uuid = device.p_uuid.lock();
                    if p_uuid.is_some() {
                        *p_uuid = Some(*uuids);
                    }
                }
            }

            conn.registry.set_state(device, ns, StateFlags::VERBOSE);
        }
        device.put_ldev();
    }

    device.rs_total.store(0, Ordering::Release);
    device.rs_failed.store(0, Ordering::Release);
    device.rs_paused_ms.store(0, Ordering::Release);
    if verify_done {
        device.ov_start_sector.store(0, Ordering::Release);
    }

    device.md_sync();

    if let Some(cmd) = khelper_cmd {
        conn.helper.invoke(device.minor, cmd);
    }
}

/// Start a resync run as `side`.
///
/// Runs the before-resync handlers (with their exit-code policy), defers
/// via a short timer instead of blocking on the state mutex when called
/// from the worker, computes the initial pause state from the dependency
/// graph, initializes the run counters, and arms the resync timer on the
/// target side.
pub fn start_resync(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    side: ConnState,
    from_worker: bool,
) {
    let os = device.state();
    if os.conn >= ConnState::SyncSource && os.conn < ConnState::Ahead {
        error!(minor = device.minor, "resync already running");
        return;
    }

    if os.conn < ConnState::Ahead {
        // A previous run may have been aborted by an I/O error or a
        // detach on the peer; drop its leftovers. Connections bouncing
        // between Ahead/Behind and the sync states keep their state.
        device.rs_lru.cancel_all();
    }

    if !device.flags().contains(DeviceFlags::RS_H_DONE) {
        if side == ConnState::SyncTarget {
            // Application I/O was locked out while waiting for the
            // bitmap and sync UUID; becoming SyncTarget makes our data
            // inconsistent, so give the handler a veto.
            let r = conn.helper.invoke(device.minor, "before-resync-target");
            if r > 0 {
                info!(
                    minor = device.minor,
                    exit = r,
                    "before-resync-target handler vetoed, dropping connection"
                );
                conn.request_state(ConnState::Disconnecting, StateFlags::HARD);
                return;
            }
        } else {
            let r = conn.helper.invoke(device.minor, "before-resync-source");
            if r > 0 {
                if r == 3 {
                    info!(
                        minor = device.minor,
                        exit = r,
                        "before-resync-source handler returned 3, ignoring (old userland tools?)"
                    );
                } else {
                    info!(
                        minor = device.minor,
                        exit = r,
                        "before-resync-source handler vetoed, dropping connection"
                    );
                    conn.request_state(ConnState::Disconnecting, StateFlags::HARD);
                    return;
                }
            }
        }
    }

    let _state_guard = if from_worker {
        // The worker must not sleep on the state mutex; that can take
        // long. Defer instead.
        match device.state_mutex.try_lock() {
            Some(guard) => guard,
            None => {
                device.set_flags(DeviceFlags::RS_H_DONE);
                conn.arm_start_resync_timer(device, side, Duration::from_millis(200));
                return;
            }
        }
    } else {
        device.state_mutex.lock()
    };
    device.clear_flags(DeviceFlags::RS_H_DONE);

    if !device.get_ldev_if_state(DiskState::Negotiating) {
        return;
    }

    let success;
    {
        let devices = conn.registry.write();

        let current = device.state();
        success = current.conn >= ConnState::Connected;
        if success {
            let mut ns = current;
            ns.aftr_isp = !dependencies::may_sync_now_locked(&devices, device);
            ns.conn = side;
            if side == ConnState::SyncTarget {
                ns.disk = DiskState::Inconsistent;
            } else {
                ns.pdsk = DiskState::Inconsistent;
            }
            device.set_state_locked(ns, StateFlags::VERBOSE);

            let tw = device.bitmap.total_weight();
            device.rs_failed.store(0, Ordering::Release);
            device.rs_paused_ms.store(0, Ordering::Release);
            device.rs_same_csum.store(0, Ordering::Release);
            device.rs_total.store(tw, Ordering::Release);
            device.reset_rs_marks(tw);

            dependencies::pause_after_locked(&devices);
        }
    }

    if success {
        let tw = device.rs_total.load(Ordering::Acquire);
        info!(
            minor = device.minor,
            side = ?side,
            kib = tw << (BM_BLOCK_SHIFT - 10),
            bits = tw,
            "began resync"
        );

        if side == ConnState::SyncTarget {
            device.bm_resync_fo.store(0, Ordering::Release);
        }

        let proto = conn.agreed_pro_version.load(Ordering::Acquire);

        // Since protocol 96 the sync UUID goes out with the state
        // change; older peers need it from here.
        if side == ConnState::SyncSource && proto < PRO_VERSION_SYNC_UUID_FROM_WORKER {
            let uuid = device.uuids.lock().get(UuidIndex::Current);
            let _ = conn.send_sync_uuid(uuid);
        }

        if proto < PRO_VERSION_EXPLICIT_FINISH && tw == 0 {
            // Old peers have no resync-finished notification; an empty
            // resync completes right here. On the source side, wait out
            // a ping round first so the target gets a chance to detect a
            // lost connection. That narrows the full-sync-on-next-
            // handshake race considerably, but does not solve it.
            if side == ConnState::SyncSource {
                std::thread::sleep(conn.ping_int() + conn.ping_timeo() / 9);
            }
            resync_finished(conn, device);
        }

        controller::rs_controller_reset(device);

        // We may have been paused in between or become paused until the
        // timer fires; the tick handles that.
        if device.state().conn == ConnState::SyncTarget {
            conn.arm_resync_timer(device, Duration::ZERO);
        }

        device.md_sync();
    }
    device.put_ldev();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_log::{NullActivityLog, NullResyncLru, ResyncLru};
    use crate::bitmap::{MemoryBitmap, SyncBitmap};
    use crate::checksum::ChecksumAlgorithm;
    use crate::config::SyncConfig;
    use crate::device::{NullLowerDevice, Registry};
    use crate::requests::{HeapAllocator, NullRequestStateMachine, PeerRequest, PeerRequestAllocator};
    use crate::state::{DeviceState, NullHelper};
    use crate::timer::TimerService;
    use crate::transport::mock::RecordingTransport;
    use crate::transport::StreamKind;

    struct Harness {
        conn: Arc<Connection>,
        transport: Arc<RecordingTransport>,
        registry: Arc<Registry>,
    }

    fn harness() -> Harness {
        crate::logging::init_for_tests();
        let registry = Arc::new(Registry::new());
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(
            registry.clone(),
            transport.clone(),
            TimerService::new(),
            Arc::new(NullRequestStateMachine),
            Arc::new(NullHelper),
            Arc::new(HeapAllocator),
        );
        Harness {
            conn,
            transport,
            registry,
        }
    }

    fn sync_target_device(
        harness: &Harness,
        capacity_sectors: u64,
        config: SyncConfig,
    ) -> (Arc<Device>, Arc<MemoryBitmap>) {
        let bitmap = Arc::new(MemoryBitmap::new(capacity_sectors));
        let device = Device::new(
            0,
            capacity_sectors,
            config,
            bitmap.clone(),
            Arc::new(NullActivityLog),
            Arc::new(NullResyncLru),
            Arc::new(NullLowerDevice),
        );
        harness.conn.add_device(device.clone());
        let ns = DeviceState {
            conn: ConnState::SyncTarget,
            disk: DiskState::Inconsistent,
            pdsk: DiskState::UpToDate,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        };
        harness.registry.set_state(&device, ns, StateFlags::HARD);
        device
            .rs_total
            .store(bitmap.total_weight(), Ordering::Release);
        (device, bitmap)
    }

    /// Fixed-rate config yielding exactly `number` blocks per tick.
    fn fixed_rate(number: u64) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.c_plan_ahead = 0;
        config.resync_rate = number * 40;
        config.max_bio_size = 65536;
        config
    }

    fn ack_ping_soon(conn: &Arc<Connection>) {
        let conn = conn.clone();
        std::thread::spawn(move || {
            // Re-fire until the waiter has certainly seen one ack.
            for _ in 0..200 {
                conn.got_ping_ack();
                std::thread::sleep(Duration::from_millis(10));
            }
        });
    }

    #[test]
    fn test_empty_resync_finishes_immediately() {
        let h = harness();
        let (device, _bm) = sync_target_device(&h, 1 << 16, fixed_rate(4));
        device.rs_total.store(0, Ordering::Release);

        ack_ping_soon(&h.conn);
        make_resync_request(&h.conn, &device, false).unwrap();

        assert_eq!(device.state().conn, ConnState::Connected);
        assert_eq!(device.state().disk, DiskState::UpToDate);
        assert!(h.transport.sent_frames(StreamKind::Data).is_empty());
    }

    #[test]
    fn test_cancel_is_a_no_op() {
        let h = harness();
        let (device, bm) = sync_target_device(&h, 1 << 16, fixed_rate(4));
        bm.set_bits(100..104);
        device.rs_total.store(4, Ordering::Release);

        make_resync_request(&h.conn, &device, true).unwrap();
        assert!(h.transport.sent_frames(StreamKind::Data).is_empty());
        assert_eq!(device.bm_resync_fo.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_coalesced_request() {
        let h = harness();
        let (device, bm) = sync_target_device(&h, 1 << 20, fixed_rate(4));
        bm.set_bits(100..104);
        device.rs_total.store(4, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        let frames = h.transport.sent_frames(StreamKind::Data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg, MessageType::RsDataRequest);
        let block = frames[0].block.unwrap();
        assert_eq!(block.sector, 800);
        assert_eq!(block.size, 16384);
        assert_eq!(device.bm_resync_fo.load(Ordering::Acquire), 104);
        assert_eq!(device.rs_pending.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_coalescing_stops_at_max_bio_size() {
        let h = harness();
        let mut config = fixed_rate(2);
        config.max_bio_size = 8192;
        let (device, bm) = sync_target_device(&h, 1 << 20, config);
        bm.set_bits(100..104);
        device.rs_total.store(4, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        let frames = h.transport.sent_frames(StreamKind::Data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].block.unwrap().size, 8192);
        assert_eq!(device.bm_resync_fo.load(Ordering::Acquire), 102);
    }

    #[test]
    fn test_coalescing_stops_at_clean_bit() {
        let h = harness();
        let (device, bm) = sync_target_device(&h, 1 << 20, fixed_rate(2));
        bm.set_bits(100..102);
        device.rs_total.store(2, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        let frames = h.transport.sent_frames(StreamKind::Data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].block.unwrap().size, 8192);
    }

    #[test]
    fn test_coalescing_stops_at_extent_boundary() {
        let h = harness();
        let mut config = fixed_rate(16);
        config.max_bio_size = 1 << 20;
        let (device, bm) = sync_target_device(&h, 1 << 20, config);
        // Dirty range straddling the extent boundary at bit 4096.
        bm.set_bits(4088..4101);
        device.rs_total.store(13, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        let frames = h.transport.sent_frames(StreamKind::Data);
        let block = frames[0].block.unwrap();
        assert_eq!(block.sector, 4088 * 8);
        // Eight blocks up to and including bit 4095, never across.
        assert_eq!(block.size, 8 * 4096);
    }

    #[test]
    fn test_coalescing_stops_at_misalignment() {
        let h = harness();
        let (device, bm) = sync_target_device(&h, 1 << 20, fixed_rate(4));
        // Odd start bit: sector 808 is not 16-sector aligned.
        bm.set_bits(101..104);
        device.rs_total.store(3, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        let frames = h.transport.sent_frames(StreamKind::Data);
        assert_eq!(frames[0].block.unwrap().size, 4096);
        assert_eq!(frames[0].block.unwrap().sector, 808);
    }

    #[test]
    fn test_capacity_clamps_last_request() {
        let h = harness();
        let (device, bm) = sync_target_device(&h, 804, fixed_rate(4));
        bm.set_bits(100..101);
        device.rs_total.store(1, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        let frames = h.transport.sent_frames(StreamKind::Data);
        assert_eq!(frames.len(), 1);
        let block = frames[0].block.unwrap();
        assert_eq!(block.sector, 800);
        assert_eq!(block.size, 2048);
    }

    #[test]
    fn test_backpressure_defers_production() {
        let h = harness();
        let (device, bm) = sync_target_device(&h, 1 << 20, fixed_rate(4));
        bm.set_bits(100..104);
        device.rs_total.store(4, Ordering::Release);
        h.transport.set_send_buffer(20, 11);

        make_resync_request(&h.conn, &device, false).unwrap();

        assert!(h.transport.sent_frames(StreamKind::Data).is_empty());
        assert_eq!(device.bm_resync_fo.load(Ordering::Acquire), 0);
    }

    struct FailingAllocator;
    impl PeerRequestAllocator for FailingAllocator {
        fn alloc(
            &self,
            _minor: u32,
            _block_id: u64,
            _sector: u64,
            _size: u32,
        ) -> Option<Arc<PeerRequest>> {
            None
        }
        fn free(&self, _req: Arc<PeerRequest>) {}
    }

    #[test]
    fn test_csum_allocation_failure_rolls_back() {
        crate::logging::init_for_tests();
        let registry = Arc::new(Registry::new());
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(
            registry.clone(),
            transport.clone(),
            TimerService::new(),
            Arc::new(NullRequestStateMachine),
            Arc::new(NullHelper),
            Arc::new(FailingAllocator),
        );
        conn.agreed_pro_version.store(96, Ordering::Release);
        let h = Harness {
            conn,
            transport,
            registry,
        };

        let mut config = fixed_rate(4);
        config.csums_alg = Some(ChecksumAlgorithm::Crc32);
        let (device, bm) = sync_target_device(&h, 1 << 20, config);
        bm.set_bits(100..104);
        device.rs_total.store(4, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        // Rolled back: cursor restored, nothing sent, nothing pending.
        assert!(h.transport.sent_frames(StreamKind::Data).is_empty());
        assert_eq!(device.bm_resync_fo.load(Ordering::Acquire), 100);
        assert_eq!(device.rs_pending.load(Ordering::Acquire), 0);
        assert!(h.conn.ee().read_ee.is_empty());
    }

    #[test]
    fn test_csum_path_reads_locally_instead_of_sending() {
        let h = harness();
        h.conn.agreed_pro_version.store(96, Ordering::Release);
        let mut config = fixed_rate(4);
        config.csums_alg = Some(ChecksumAlgorithm::Crc32);
        let (device, bm) = sync_target_device(&h, 1 << 20, config);
        bm.set_bits(100..104);
        device.rs_total.store(4, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        // No wire traffic yet: the block is read locally first.
        assert!(h.transport.sent_frames(StreamKind::Data).is_empty());
        let ee = h.conn.ee();
        assert_eq!(ee.read_ee.len(), 1);
        assert_eq!(*ee.read_ee[0].work.lock(), PeerWork::SendCsum);
        drop(ee);
        assert_eq!(device.rs_sect_ev.load(Ordering::Acquire), 32);
    }

    #[test]
    fn test_old_protocol_ignores_csum_config() {
        let h = harness();
        // agreed_pro_version stays at the default of 80
        let mut config = fixed_rate(4);
        config.csums_alg = Some(ChecksumAlgorithm::Crc32);
        let (device, bm) = sync_target_device(&h, 1 << 20, config);
        bm.set_bits(100..104);
        device.rs_total.store(4, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        assert_eq!(h.transport.sent_frames(StreamKind::Data).len(), 1);
        assert!(h.conn.ee().read_ee.is_empty());
    }

    struct ContendedLru;
    impl ResyncLru for ContendedLru {
        fn try_begin_io(&self, _sector: u64) -> bool {
            false
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

    #[test]
    fn test_extent_contention_defers() {
        let h = harness();
        let bitmap = Arc::new(MemoryBitmap::new(1 << 20));
        bitmap.set_bits(100..104);
        let device = Device::new(
            0,
            1 << 20,
            fixed_rate(4),
            bitmap,
            Arc::new(NullActivityLog),
            Arc::new(ContendedLru),
            Arc::new(NullLowerDevice),
        );
        h.conn.add_device(device.clone());
        let ns = DeviceState {
            conn: ConnState::SyncTarget,
            disk: DiskState::Inconsistent,
            pdsk: DiskState::UpToDate,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        };
        h.registry.set_state(&device, ns, StateFlags::HARD);
        device.rs_total.store(4, Ordering::Release);

        make_resync_request(&h.conn, &device, false).unwrap();

        assert!(h.transport.sent_frames(StreamKind::Data).is_empty());
        assert_eq!(device.bm_resync_fo.load(Ordering::Acquire), 100);
    }

    #[test]
    fn test_ov_sweep_requests_without_coalescing() {
        let h = harness();
        let (device, _bm) = sync_target_device(&h, 1 << 20, fixed_rate(3));
        let ns = DeviceState {
            conn: ConnState::VerifyS,
            disk: DiskState::UpToDate,
            pdsk: DiskState::UpToDate,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        };
        h.registry.set_state(&device, ns, StateFlags::HARD);
        device.ov_position.store(0, Ordering::Release);

        make_ov_request(&h.conn, &device, false).unwrap();

        let frames = h.transport.sent_frames(StreamKind::Data);
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.msg, MessageType::OvRequest);
            let block = frame.block.unwrap();
            assert_eq!(block.sector, i as u64 * BM_SECT_PER_BIT);
            assert_eq!(block.size, BM_BLOCK_SIZE);
        }
        assert_eq!(device.ov_position.load(Ordering::Acquire), 24);
        assert_eq!(device.rs_pending.load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_resync_finished_reports_failed_blocks() {
        let h = harness();
        let (device, bm) = sync_target_device(&h, 1 << 16, fixed_rate(4));
        bm.set_bits(10..12);
        device.rs_total.store(2, Ordering::Release);
        device.rs_failed.store(2, Ordering::Release);

        ack_ping_soon(&h.conn);
        resync_finished(&h.conn, &device);

        // Failed target resync: local stays inconsistent, peer is good.
        let state = device.state();
        assert_eq!(state.conn, ConnState::Connected);
        assert_eq!(state.disk, DiskState::Inconsistent);
        assert_eq!(state.pdsk, DiskState::UpToDate);
        assert_eq!(device.rs_total.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_resync_finished_adopts_peer_uuids() {
        let h = harness();
        let (device, _bm) = sync_target_device(&h, 1 << 16, fixed_rate(4));
        device.rs_total.store(0, Ordering::Release);
        device.uuids.lock().set(UuidIndex::Current, 0xAAAA);
        let mut peer = crate::device::UuidSet::default();
        peer.set(UuidIndex::Current, 0xBBBB);
        peer.set(UuidIndex::Bitmap, 0xB17);
        *device.p_uuid.lock() = Some(peer);

        ack_ping_soon(&h.conn);
        resync_finished(&h.conn, &device);

        let uuids = device.uuids.lock();
        assert_eq!(uuids.get(UuidIndex::Current), 0xBBBB);
        // our old current became the bitmap uuid, then was zeroed by the
        // both-sides-equal update
        assert_eq!(uuids.get(UuidIndex::Bitmap), 0);
    }

    struct StickyLru;
    impl ResyncLru for StickyLru {
        fn try_begin_io(&self, _sector: u64) -> bool {
            true
        }
        fn complete_io(&self, _sector: u64) {}
        fn del_all(&self) -> bool {
            false
        }
        fn cancel_all(&self) {}
        fn should_slow_down(&self, _sector: u64) -> bool {
            false
        }
    }

    #[test]
    fn test_resync_finished_retries_while_lru_busy() {
        let h = harness();
        let bitmap = Arc::new(MemoryBitmap::new(1 << 16));
        let device = Device::new(
            0,
            1 << 16,
            fixed_rate(4),
            bitmap,
            Arc::new(NullActivityLog),
            Arc::new(StickyLru),
            Arc::new(NullLowerDevice),
        );
        h.conn.add_device(device.clone());

        resync_finished(&h.conn, &device);

        // Could not drain: a retry item went back on the queue.
        assert_eq!(h.conn.queue.len(), 1);
    }

    #[test]
    fn test_start_resync_handler_veto_drops_connection() {
        struct Veto;
        impl crate::state::Helper for Veto {
            fn invoke(&self, _minor: u32, cmd: &str) -> i32 {
                if cmd == "before-resync-target" {
                    1
                } else {
                    0
                }
            }
        }

        crate::logging::init_for_tests();
        let registry = Arc::new(Registry::new());
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(
            registry.clone(),
            transport,
            TimerService::new(),
            Arc::new(NullRequestStateMachine),
            Arc::new(Veto),
            Arc::new(HeapAllocator),
        );
        conn.request_state(ConnState::Connected, StateFlags::HARD);

        let bitmap = Arc::new(MemoryBitmap::new(1 << 16));
        let device = Device::new(
            0,
            1 << 16,
            SyncConfig::default(),
            bitmap,
            Arc::new(NullActivityLog),
            Arc::new(NullResyncLru),
            Arc::new(NullLowerDevice),
        );
        conn.add_device(device.clone());
        let ns = DeviceState {
            conn: ConnState::Connected,
            disk: DiskState::Inconsistent,
            pdsk: DiskState::UpToDate,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        };
        registry.set_state(&device, ns, StateFlags::HARD);

        start_resync(&conn, &device, ConnState::SyncTarget, false);

        assert_eq!(conn.cstate(), ConnState::Disconnecting);
        assert_ne!(device.state().conn, ConnState::SyncTarget);
    }

    #[test]
    fn test_start_resync_source_exit_3_ignored() {
        struct OldTools;
        impl crate::state::Helper for OldTools {
            fn invoke(&self, _minor: u32, cmd: &str) -> i32 {
                if cmd == "before-resync-source" {
                    3
                } else {
                    0
                }
            }
        }

        crate::logging::init_for_tests();
        let registry = Arc::new(Registry::new());
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(
            registry.clone(),
            transport,
            TimerService::new(),
            Arc::new(NullRequestStateMachine),
            Arc::new(OldTools),
            Arc::new(HeapAllocator),
        );
        conn.request_state(ConnState::Connected, StateFlags::HARD);

        let bitmap = Arc::new(MemoryBitmap::new(1 << 16));
        bitmap.set_bits(0..4);
        let device = Device::new(
            0,
            1 << 16,
            SyncConfig::default(),
            bitmap,
            Arc::new(NullActivityLog),
            Arc::new(NullResyncLru),
            Arc::new(NullLowerDevice),
        );
        conn.add_device(device.clone());
        let ns = DeviceState {
            conn: ConnState::Connected,
            disk: DiskState::UpToDate,
            pdsk: DiskState::Inconsistent,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        };
        registry.set_state(&device, ns, StateFlags::HARD);

        start_resync(&conn, &device, ConnState::SyncSource, false);

        // exit 3 from the source handler is tolerated
        assert_eq!(device.state().conn, ConnState::SyncSource);
        assert_eq!(device.state().pdsk, DiskState::Inconsistent);
        assert_eq!(device.rs_total.load(Ordering::Acquire), 4);
    }

    #[test]
    fn test_start_resync_defers_when_state_mutex_contended() {
        let h = harness();
        let (device, bm) = sync_target_device(&h, 1 << 16, fixed_rate(4));
        bm.set_bits(0..4);
        let ns = DeviceState {
            conn: ConnState::Connected,
            disk: DiskState::Inconsistent,
            pdsk: DiskState::UpToDate,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        };
        h.registry.set_state(&device, ns, StateFlags::HARD);

        let _held = device.state_mutex.lock();
        start_resync(&h.conn, &device, ConnState::SyncTarget, true);

        // deferred: handlers marked done, timer armed, state unchanged
        assert!(device.flags().contains(DeviceFlags::RS_H_DONE));
        assert_eq!(device.state().conn, ConnState::Connected);
    }
}
