//! Endio dispatch: completions from the lower block device.
//!
//! These handlers are called by the block layer on foreign threads and
//! must not block. They do their accounting under the request lock,
//! through atomics, or by enqueueing worker items; every blocking
//! follow-up runs on the worker.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::connection::{ee_remove, Connection, WriteOrdering};
use crate::device::Device;
use crate::metrics::EngineMetrics;
use crate::requests::{EeFlags, PeerRequest, PeerWork, ReqEvent, Request, ID_SYNCER};
use crate::work::WorkItem;
use crate::worker::Completion;

/// Synchronous meta-data or bitmap I/O descriptor.
pub struct MdIo {
    /// Error reported by the completion, if any
    pub error: Mutex<Option<i32>>,
    /// Signalled once the I/O finished
    pub done: Completion,
}

impl Default for MdIo {
    fn default() -> Self {
        Self::new()
    }
}

impl MdIo {
    /// Create a pending meta-data I/O descriptor.
    pub fn new() -> Self {
        Self {
            error: Mutex::new(None),
            done: Completion::new(),
        }
    }
}

/// Completion of synchronous meta-data I/O. Pure handoff: record the
/// error, signal the waiter.
pub fn md_io_complete(md_io: &MdIo, error: Option<i32>) {
    *md_io.error.lock() = error;
    md_io.done.complete();
}

/// Completion of a bio submitted on behalf of the peer (replicated
/// write, resync read/write, verify read).
///
/// Some lower-level drivers fail a request by clearing the up-to-date
/// flag without reporting an error; that is normalized to an I/O error
/// here. The last completer of a multi-bio request runs the final path
/// for its direction.
pub fn peer_request_endio(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    peer_req: &Arc<PeerRequest>,
    write: bool,
    uptodate: bool,
    mut error: Option<i32>,
) {
    if let Some(code) = error {
        warn!(
            minor = device.minor,
            sector = peer_req.sector,
            code,
            "{} failed",
            if write { "write" } else { "read" }
        );
    }
    if error.is_none() && !uptodate {
        warn!(
            minor = device.minor,
            sector = peer_req.sector,
            "{}: not up to date, setting error",
            if write { "write" } else { "read" }
        );
        error = Some(EIO);
    }
    if error.is_some() {
        peer_req.set_flags(EeFlags::WAS_ERROR);
    }

    if peer_req.pending_bios.fetch_sub(1, Ordering::AcqRel) == 1 {
        if write {
            endio_write_sec_final(conn, device, peer_req);
        } else {
            endio_read_sec_final(conn, device, peer_req);
        }
    }
}

const EIO: i32 = 5;

/// Final stage of a read on behalf of the peer.
fn endio_read_sec_final(conn: &Arc<Connection>, device: &Arc<Device>, peer_req: &Arc<PeerRequest>) {
    let wake;
    {
        let mut ee = conn.ee();
        device
            .read_cnt
            .fetch_add(u64::from(peer_req.size) >> 9, Ordering::Relaxed);
        ee_remove(&mut ee.read_ee, peer_req);
        wake = ee.read_ee.is_empty();
        if peer_req.flags().contains(EeFlags::WAS_ERROR) {
            EngineMetrics::inc(&conn.metrics.io_errors);
            device.chk_io_error(&conn.registry);
        }
    }
    if wake {
        conn.wake_ee_waiters();
    }

    if let Some(item) = WorkItem::from_peer_work(device.clone(), peer_req.clone()) {
        conn.queue.queue(item);
    }
    device.put_ldev();
}

/// Final stage of a write on behalf of the peer (replicated or resync).
fn endio_write_sec_final(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    peer_req: &Arc<PeerRequest>,
) {
    // A failed barrier write disables barriers and goes back to the
    // worker for resubmission as a plain flushed write.
    if peer_req.is_failed_barrier() {
        conn.bump_write_ordering(WriteOrdering::BdevFlush);
        {
            let mut ee = conn.ee();
            if !ee_remove(&mut ee.active_ee, peer_req) {
                ee_remove(&mut ee.sync_ee, peer_req);
            }
        }
        peer_req.clear_flags(EeFlags::WAS_ERROR);
        peer_req.set_flags(EeFlags::RESUBMITTED);
        *peer_req.work.lock() = PeerWork::Reissue;
        // The backing-device reference is dropped when the reissued
        // write completes.
        if let Some(item) = WorkItem::from_peer_work(device.clone(), peer_req.clone()) {
            conn.queue.queue(item);
        }
        return;
    }

    // After the request moves to done_ee it may be freed or reused the
    // moment the request lock drops; capture what the tail needs first.
    let sector = peer_req.sector;
    let size = peer_req.size;
    let block_id = peer_req.block_id.load(Ordering::Acquire);
    let do_al_complete = peer_req.flags().contains(EeFlags::CALL_AL_COMPLETE_IO);

    let do_wake;
    {
        let mut ee = conn.ee();
        device
            .writ_cnt
            .fetch_add(u64::from(size) >> 9, Ordering::Relaxed);
        if !ee_remove(&mut ee.active_ee, peer_req) {
            ee_remove(&mut ee.sync_ee, peer_req);
        }
        ee.done_ee.push_back(peer_req.clone());

        do_wake = if block_id == ID_SYNCER {
            ee.sync_ee.is_empty()
        } else {
            ee.active_ee.is_empty()
        };

        if peer_req.flags().contains(EeFlags::WAS_ERROR) {
            EngineMetrics::inc(&conn.metrics.io_errors);
            device.chk_io_error(&conn.registry);
        }
    }

    if block_id == ID_SYNCER {
        device.rs_lru.complete_io(sector);
    }
    if do_wake {
        conn.wake_ee_waiters();
    }
    if do_al_complete {
        device.act_log.complete_io(sector, size);
    }
    conn.wake_asender();
    device.put_ldev();
}

/// Completion of a primary request's private bio (application read,
/// read-ahead, or write on the primary).
pub fn request_endio(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    req: &Arc<Request>,
    read_ahead: bool,
    uptodate: bool,
    error: Option<i32>,
) {
    let failed = error.is_some() || {
        if !uptodate {
            warn!(
                minor = device.minor,
                "p {}: setting error, not up to date",
                if req.write { "write" } else { "read" }
            );
        }
        !uptodate
    };

    let what = if failed {
        EngineMetrics::inc(&conn.metrics.io_errors);
        if req.write {
            ReqEvent::WriteCompletedWithError
        } else if read_ahead {
            ReqEvent::ReadAheadCompletedWithError
        } else {
            ReqEvent::ReadCompletedWithError
        }
    } else {
        ReqEvent::CompletedOk
    };

    // Apply under the request lock; complete the master bio outside it.
    let master = {
        let _ee = conn.ee();
        conn.req_sm.apply(req, what)
    };
    if let Some(complete) = master {
        complete();
    }
}
