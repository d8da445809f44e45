//! The work-item catalog: everything the worker can be asked to do.
//!
//! Each item carries the context it needs and runs exactly once. The
//! `cancel` argument is the uniform cancellation mechanism: true means
//! "the connection is going down; release resources, do not touch the
//! wire". Callbacks return an error instead of raising; the worker
//! decides whether that escalates.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::protocol::MessageType;
use crate::requests::{EeFlags, PeerRequest, PeerWork, ReqEvent, Request, ID_SYNCER};
use crate::resync;
use crate::state::{ConnState, DiskState};
use crate::worker::Completion;

/// One unit of work for the connection's worker.
pub enum WorkItem {
    /// Send a write-ordering barrier, unless the epoch was cleared
    SendBarrier {
        /// Barrier sequence number
        barrier_nr: u32,
        /// Cleared when the epoch was thrown away before we ran
        epoch_valid: Arc<std::sync::atomic::AtomicBool>,
    },
    /// Hint the peer to unplug its queue
    SendWriteHint {
        /// Originating device
        device: Arc<Device>,
    },
    /// Tell the peer an interval is out of sync (congestion mode)
    SendOutOfSync {
        /// Originating device
        device: Arc<Device>,
        /// The application request
        req: Arc<Request>,
    },
    /// Mirror an application write
    SendDataBlock {
        /// Originating device
        device: Arc<Device>,
        /// The application request
        req: Arc<Request>,
    },
    /// Forward an application read to the peer
    SendReadRequest {
        /// Originating device
        device: Arc<Device>,
        /// The application request
        req: Arc<Request>,
    },
    /// Retry a failed local read against the peer
    RetryReadRemote {
        /// Originating device
        device: Arc<Device>,
        /// The application request
        req: Arc<Request>,
    },
    /// Resync tick: produce resync or verify requests per device state
    ResyncTick {
        /// Device being synced
        device: Arc<Device>,
    },
    /// Digest a completed resync read and send a checksum request
    SendCsum {
        /// Device being synced
        device: Arc<Device>,
        /// The completed local read
        peer_req: Arc<PeerRequest>,
    },
    /// Answer a peer read with data (or a negative ack)
    DataReply {
        /// Serving device
        device: Arc<Device>,
        /// The completed local read
        peer_req: Arc<PeerRequest>,
    },
    /// Answer a resync read with data
    RsDataReply {
        /// Serving device
        device: Arc<Device>,
        /// The completed local read
        peer_req: Arc<PeerRequest>,
    },
    /// Compare digests for a checksum resync request
    CsumReply {
        /// Serving device
        device: Arc<Device>,
        /// The completed local read, digest attached
        peer_req: Arc<PeerRequest>,
    },
    /// Digest a completed verify read and answer the verify request
    OvReplyDigest {
        /// Serving device
        device: Arc<Device>,
        /// The completed local read
        peer_req: Arc<PeerRequest>,
    },
    /// Compare digests for a verify reply and report the result
    OvReply {
        /// Driving device
        device: Arc<Device>,
        /// The completed local read, peer digest attached
        peer_req: Arc<PeerRequest>,
    },
    /// Finish the resync run
    ResyncFinished {
        /// Device whose run ended
        device: Arc<Device>,
    },
    /// Start a resync as the given side
    StartResync {
        /// Device to sync
        device: Arc<Device>,
        /// `SyncSource` or `SyncTarget`
        side: ConnState,
    },
    /// Re-issue a frozen application request to the backing device
    RestartDiskIo {
        /// Owning device
        device: Arc<Device>,
        /// The request to resubmit
        req: Arc<Request>,
    },
    /// Re-issue a write whose barrier failed
    Reissue {
        /// Owning device
        device: Arc<Device>,
        /// The write to resubmit
        peer_req: Arc<PeerRequest>,
    },
    /// Signal a waiter once all previously queued work ran
    BarrierDone {
        /// Completion to signal
        done: Arc<Completion>,
    },
    /// Externally supplied callback (receiver-side handlers)
    Callback {
        /// The callback; receives the cancel flag
        f: Box<dyn FnOnce(bool) -> Result<()> + Send>,
    },
}

impl WorkItem {
    /// Build the follow-up work item a completed peer request asked for.
    pub fn from_peer_work(device: Arc<Device>, peer_req: Arc<PeerRequest>) -> Option<WorkItem> {
        let work = *peer_req.work.lock();
        match work {
            PeerWork::None => None,
            PeerWork::SendCsum => Some(WorkItem::SendCsum { device, peer_req }),
            PeerWork::DataReply => Some(WorkItem::DataReply { device, peer_req }),
            PeerWork::RsDataReply => Some(WorkItem::RsDataReply { device, peer_req }),
            PeerWork::CsumReply => Some(WorkItem::CsumReply { device, peer_req }),
            PeerWork::OvReplyDigest => Some(WorkItem::OvReplyDigest { device, peer_req }),
            PeerWork::OvReply => Some(WorkItem::OvReply { device, peer_req }),
            PeerWork::Reissue => Some(WorkItem::Reissue { device, peer_req }),
        }
    }

    /// Run the item. Called exactly once, by the worker.
    pub fn run(self, conn: &Arc<Connection>, cancel: bool) -> Result<()> {
        match self {
            WorkItem::SendBarrier {
                barrier_nr,
                epoch_valid,
            } => {
                // Re-check under the request lock: the epoch may have been
                // cleared just before this item was reassigned and
                // re-queued.
                let cancel = {
                    let _ee = conn.ee();
                    cancel
                        || !epoch_valid.load(Ordering::Acquire)
                        || conn.cstate() < ConnState::Connected
                };
                if cancel {
                    return Ok(());
                }
                conn.send_barrier(barrier_nr)
            }

            WorkItem::SendWriteHint { device: _ } => {
                if cancel {
                    return Ok(());
                }
                conn.send_write_hint()
            }

            WorkItem::SendOutOfSync { device: _, req } => {
                if cancel {
                    conn.req_sm.apply(&req, ReqEvent::SendCanceled);
                    return Ok(());
                }
                let result = conn.send_out_of_sync(&req);
                conn.req_sm.apply(&req, ReqEvent::OosHandedToNetwork);
                result
            }

            WorkItem::SendDataBlock { device, req } => {
                if cancel {
                    conn.req_sm.apply(&req, ReqEvent::SendCanceled);
                    return Ok(());
                }
                match conn.send_dblock(&device, &req) {
                    Ok(()) => {
                        conn.req_sm.apply(&req, ReqEvent::HandedOverToNetwork);
                        Ok(())
                    }
                    Err(e) => {
                        conn.req_sm.apply(&req, ReqEvent::SendFailed);
                        Err(e)
                    }
                }
            }

            WorkItem::SendReadRequest { device: _, req } => send_read_req(conn, &req, cancel),

            WorkItem::RetryReadRemote { device, req } => {
                // Do not detach for a read error; ask the peer instead so
                // the disk gets a chance to relocate the block on the
                // data reply write.
                let cancelled = {
                    let _ee = conn.ee();
                    cancel || device.state().pdsk != DiskState::UpToDate
                };
                if cancelled {
                    conn.req_sm.apply(&req, ReqEvent::ReadRetryRemoteCanceled);
                    return Ok(());
                }
                send_read_req(conn, &req, false)
            }

            WorkItem::ResyncTick { device } => {
                device.clear_flags(crate::device::DeviceFlags::RESYNC_QUEUED);
                match device.state().conn {
                    ConnState::VerifyS => resync::make_ov_request(conn, &device, cancel),
                    ConnState::SyncTarget => resync::make_resync_request(conn, &device, cancel),
                    _ => Ok(()),
                }
            }

            WorkItem::SendCsum { device, peer_req } => send_csum(conn, &device, peer_req, cancel),

            WorkItem::DataReply { device, peer_req } => {
                if cancel {
                    conn.allocator.free(peer_req);
                    device.dec_unacked();
                    return Ok(());
                }
                let result = if !peer_req.flags().contains(EeFlags::WAS_ERROR) {
                    conn.send_block(&device, MessageType::DataReply, &peer_req)
                } else {
                    warn!(
                        minor = device.minor,
                        sector = peer_req.sector,
                        "sending negative data reply"
                    );
                    conn.send_ack(MessageType::NegDReply, &peer_req)
                };
                device.dec_unacked();
                conn.move_to_net_ee_or_free(&peer_req);
                if result.is_err() {
                    warn!(minor = device.minor, "sending data reply failed");
                }
                result
            }

            WorkItem::RsDataReply { device, peer_req } => {
                rs_data_reply(conn, &device, peer_req, cancel)
            }

            WorkItem::CsumReply { device, peer_req } => {
                csum_reply(conn, &device, peer_req, cancel)
            }

            WorkItem::OvReplyDigest { device, peer_req } => {
                ov_reply_digest(conn, &device, peer_req, cancel)
            }

            WorkItem::OvReply { device, peer_req } => ov_reply(conn, &device, peer_req, cancel),

            WorkItem::ResyncFinished { device } => {
                resync::resync_finished(conn, &device);
                Ok(())
            }

            WorkItem::StartResync { device, side } => {
                if device.unacked.load(Ordering::Acquire) != 0
                    || device.rs_pending.load(Ordering::Acquire) != 0
                {
                    warn!(minor = device.minor, "postponing start of resync");
                    conn.arm_start_resync_timer(&device, side, std::time::Duration::from_millis(100));
                    return Ok(());
                }
                resync::start_resync(conn, &device, side, true);
                device.clear_flags(crate::device::DeviceFlags::AHEAD_TO_SYNC_SOURCE);
                Ok(())
            }

            WorkItem::RestartDiskIo { device, req } => {
                if req.write && req.in_act_log {
                    device.act_log.begin_io(req.sector, req.size)?;
                }
                device.lower.submit_request(&req)
            }

            WorkItem::Reissue { device, peer_req } => {
                if cancel {
                    conn.allocator.free(peer_req);
                    return Ok(());
                }
                conn.ee().active_ee.push_back(peer_req.clone());
                device.lower.submit_peer_request(&peer_req, true)
            }

            WorkItem::BarrierDone { done } => {
                done.complete();
                Ok(())
            }

            WorkItem::Callback { f } => f(cancel),
        }
    }
}

fn send_read_req(conn: &Arc<Connection>, req: &Arc<Request>, cancel: bool) -> Result<()> {
    if cancel {
        conn.req_sm.apply(req, ReqEvent::SendCanceled);
        return Ok(());
    }
    let block_id = Arc::as_ptr(req) as u64;
    match conn.send_drequest(MessageType::DataRequest, req.sector, req.size, block_id) {
        Ok(()) => {
            conn.req_sm.apply(req, ReqEvent::HandedOverToNetwork);
            Ok(())
        }
        Err(e) => {
            conn.req_sm.apply(req, ReqEvent::SendFailed);
            Err(e)
        }
    }
}

/// Digest a completed checksum read and send the digest instead of the
/// block.
fn send_csum(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    peer_req: Arc<PeerRequest>,
    cancel: bool,
) -> Result<()> {
    if cancel || peer_req.flags().contains(EeFlags::WAS_ERROR) {
        conn.allocator.free(peer_req);
        return Ok(());
    }

    let Some(alg) = device.sync_config.lock().csums_alg else {
        conn.allocator.free(peer_req);
        return Err(Error::protocol("checksum work without checksum transform"));
    };

    let sector = peer_req.sector;
    let size = peer_req.size;
    let digest = {
        let pages = peer_req.pages.lock();
        alg.digest_pages(&pages, size as usize)
    };
    // Free the request and its pages before sending. Blocking on a
    // congested link while holding pages can deadlock against a peer in
    // the same situation.
    conn.allocator.free(peer_req);

    device.inc_rs_pending();
    let result = conn.send_drequest_csum(MessageType::CsumRsRequest, sector, size, &digest);
    if result.is_err() {
        warn!(minor = device.minor, "sending checksum request failed");
    }
    result
}

fn rs_data_reply(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    peer_req: Arc<PeerRequest>,
    cancel: bool,
) -> Result<()> {
    if cancel {
        conn.allocator.free(peer_req);
        device.dec_unacked();
        return Ok(());
    }

    if device.get_ldev_if_state(DiskState::Failed) {
        device.rs_lru.complete_io(peer_req.sector);
        device.put_ldev();
    }

    let result = if device.state().conn == ConnState::Ahead {
        conn.send_ack(MessageType::RsCancel, &peer_req)
    } else if !peer_req.flags().contains(EeFlags::WAS_ERROR) {
        if device.state().pdsk >= DiskState::Inconsistent {
            device.inc_rs_pending();
            conn.send_block(&device, MessageType::RsDataReply, &peer_req)
        } else {
            warn!(
                minor = device.minor,
                "not sending resync reply, partner diskless"
            );
            Ok(())
        }
    } else {
        warn!(
            minor = device.minor,
            sector = peer_req.sector,
            "sending negative resync reply"
        );
        let result = conn.send_ack(MessageType::NegRsDReply, &peer_req);
        resync::rs_failed_io(device, peer_req.sector, peer_req.size);
        result
    };

    device.dec_unacked();
    conn.move_to_net_ee_or_free(&peer_req);
    if result.is_err() {
        warn!(minor = device.minor, "sending resync reply failed");
    }
    result
}

fn csum_reply(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    peer_req: Arc<PeerRequest>,
    cancel: bool,
) -> Result<()> {
    if cancel {
        conn.allocator.free(peer_req);
        device.dec_unacked();
        return Ok(());
    }

    if device.get_ldev() {
        device.rs_lru.complete_io(peer_req.sector);
        device.put_ldev();
    }

    let di = peer_req.digest.lock().clone();

    let result = if !peer_req.flags().contains(EeFlags::WAS_ERROR) {
        let equal = match (device.sync_config.lock().csums_alg, &di) {
            (Some(alg), Some(di)) => {
                let digest = {
                    let pages = peer_req.pages.lock();
                    alg.digest_pages(&pages, peer_req.size as usize)
                };
                debug_assert_eq!(digest.len(), di.data.len());
                digest == di.data
            }
            _ => false,
        };

        if equal {
            resync::set_in_sync(device, peer_req.sector, peer_req.size);
            device.rs_same_csum.fetch_add(
                u64::from(peer_req.size) >> crate::bitmap::BM_BLOCK_SHIFT,
                Ordering::Relaxed,
            );
            EngineMetrics::inc(&conn.metrics.csum_hits);
            conn.send_ack(MessageType::RsIsInSync, &peer_req)
        } else {
            device.inc_rs_pending();
            // The digest pointer dies with the block id switch.
            peer_req.block_id.store(ID_SYNCER, Ordering::Release);
            peer_req.clear_flags(EeFlags::HAS_DIGEST);
            *peer_req.digest.lock() = None;
            conn.send_block(&device, MessageType::RsDataReply, &peer_req)
        }
    } else {
        warn!(minor = device.minor, "sending negative checksum reply");
        conn.send_ack(MessageType::NegRsDReply, &peer_req)
    };

    device.dec_unacked();
    conn.move_to_net_ee_or_free(&peer_req);
    if result.is_err() {
        warn!(minor = device.minor, "sending checksum reply failed");
    }
    result
}

fn ov_reply_digest(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    peer_req: Arc<PeerRequest>,
    cancel: bool,
) -> Result<()> {
    if cancel || peer_req.flags().contains(EeFlags::WAS_ERROR) {
        conn.allocator.free(peer_req);
        device.dec_unacked();
        return Ok(());
    }

    let Some(alg) = device.sync_config.lock().verify_alg else {
        conn.allocator.free(peer_req);
        device.dec_unacked();
        return Err(Error::protocol("verify work without verify transform"));
    };

    let sector = peer_req.sector;
    let size = peer_req.size;
    let digest = {
        let pages = peer_req.pages.lock();
        alg.digest_pages(&pages, size as usize)
    };
    // As with checksum requests: free pages before potentially blocking
    // on the link.
    conn.allocator.free(peer_req);

    device.inc_rs_pending();
    let result = conn.send_drequest_csum(MessageType::OvReply, sector, size, &digest);
    if result.is_err() {
        device.dec_rs_pending();
    }
    device.dec_unacked();
    result
}

fn ov_reply(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    peer_req: Arc<PeerRequest>,
    cancel: bool,
) -> Result<()> {
    if cancel {
        conn.allocator.free(peer_req);
        device.dec_unacked();
        return Ok(());
    }

    // After a disconnect the resync lru is already cleaned out, hence
    // after the cancel check.
    if device.get_ldev() {
        device.rs_lru.complete_io(peer_req.sector);
        device.put_ldev();
    }

    let sector = peer_req.sector;
    let size = peer_req.size;
    let di = peer_req.digest.lock().clone();

    let mut equal = false;
    let mut result = Ok(());
    if !peer_req.flags().contains(EeFlags::WAS_ERROR) {
        if let (Some(alg), Some(di)) = (device.sync_config.lock().verify_alg, &di) {
            let digest = {
                let pages = peer_req.pages.lock();
                alg.digest_pages(&pages, size as usize)
            };
            debug_assert_eq!(digest.len(), di.data.len());
            equal = digest == di.data;
        }
    } else {
        result = conn.send_ack(MessageType::NegRsDReply, &peer_req);
        warn!(minor = device.minor, "verify read failed, negative reply");
    }

    // Free pages before the result ack; see send_csum.
    conn.allocator.free(peer_req);

    if !equal {
        resync::ov_out_of_sync_found(device, sector, size);
    } else {
        resync::ov_out_of_sync_print(device);
    }

    let ack = conn.send_ack_ex(
        MessageType::OvResult,
        sector,
        size,
        if equal {
            crate::protocol::ID_IN_SYNC
        } else {
            crate::protocol::ID_OUT_OF_SYNC
        },
    );
    result = result.and(ack);

    device.dec_unacked();

    let left = device.ov_left.fetch_sub(1, Ordering::AcqRel) - 1;
    // Advance progress marks every other megabyte.
    if (left & 0x200) == 0x200 {
        device.advance_rs_marks(left);
    }
    if left == 0 {
        resync::ov_out_of_sync_print(device);
        resync::resync_finished(conn, device);
    }
    debug!(minor = device.minor, left, "verify reply handled");
    result
}
