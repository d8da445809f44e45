//! Peer requests and primary requests.
//!
//! A peer request is the server-side context for a write or read issued on
//! behalf of the remote peer (replicated writes, resync reads/writes,
//! verify reads). A primary request tracks an application bio that is being
//! mirrored. The request state machine itself is an external collaborator;
//! the engine applies events to it through [`RequestStateMachine`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;

/// Block id marking resync traffic (no primary request attached).
pub const ID_SYNCER: u64 = u64::MAX;

bitflags! {
    /// Peer-request flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EeFlags: u32 {
        /// The lower device reported an error for this request
        const WAS_ERROR = 1 << 0;
        /// Call the activity log's complete on final write completion
        const CALL_AL_COMPLETE_IO = 1 << 1;
        /// This request carries a barrier
        const IS_BARRIER = 1 << 2;
        /// Already re-queued once after a failed barrier
        const RESUBMITTED = 1 << 3;
        /// `digest` points at peer-provided digest data
        const HAS_DIGEST = 1 << 4;
    }
}

/// Peer-provided digest attached to checksum and verify requests.
#[derive(Debug, Clone)]
pub struct DigestInfo {
    /// Raw digest bytes as received from the peer
    pub data: Vec<u8>,
}

/// Worker callback a peer request runs once its local I/O completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerWork {
    /// No follow-up queued
    None,
    /// Digest the read block, send a checksum request
    SendCsum,
    /// Answer a peer read with the block (or a negative ack)
    DataReply,
    /// Answer a resync read with the block
    RsDataReply,
    /// Compare digests, answer in-sync or send the block
    CsumReply,
    /// Digest the read block, answer an online-verify request
    OvReplyDigest,
    /// Compare digests for an online-verify reply
    OvReply,
    /// Re-issue a write whose barrier failed
    Reissue,
}

/// Server-side context for one peer-initiated block operation.
pub struct PeerRequest {
    /// Owning device minor
    pub minor: u32,
    /// First sector of the interval
    pub sector: u64,
    /// Interval size in bytes
    pub size: u32,
    /// Peer-visible id; `ID_SYNCER` for resync traffic
    pub block_id: AtomicU64,
    flags: AtomicU32,
    /// Digest received from the peer, when `HAS_DIGEST` is set
    pub digest: Mutex<Option<DigestInfo>>,
    /// Payload pages
    pub pages: Mutex<Vec<Bytes>>,
    /// Outstanding lower-layer bios; the last completer runs the final path
    pub pending_bios: AtomicU32,
    /// Worker follow-up to run on completion
    pub work: Mutex<PeerWork>,
}

impl PeerRequest {
    /// Create a request over `[sector, sector + size)`.
    pub fn new(minor: u32, block_id: u64, sector: u64, size: u32) -> Self {
        Self {
            minor,
            sector,
            size,
            block_id: AtomicU64::new(block_id),
            flags: AtomicU32::new(0),
            digest: Mutex::new(None),
            pages: Mutex::new(Vec::new()),
            pending_bios: AtomicU32::new(0),
            work: Mutex::new(PeerWork::None),
        }
    }

    /// Set flag bits.
    pub fn set_flags(&self, flags: EeFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear flag bits.
    pub fn clear_flags(&self, flags: EeFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Current flags snapshot.
    pub fn flags(&self) -> EeFlags {
        EeFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// True when the failed-barrier pattern holds: barrier and error set,
    /// but not yet resubmitted.
    pub fn is_failed_barrier(&self) -> bool {
        let flags = self.flags();
        flags.contains(EeFlags::IS_BARRIER | EeFlags::WAS_ERROR)
            && !flags.contains(EeFlags::RESUBMITTED)
    }
}

/// Allocator for peer requests. Allocation may fail under memory pressure;
/// background work treats that as a transient condition.
pub trait PeerRequestAllocator: Send + Sync {
    /// Allocate a peer request, or `None` under allocation pressure.
    fn alloc(&self, minor: u32, block_id: u64, sector: u64, size: u32)
        -> Option<Arc<PeerRequest>>;

    /// Return a peer request to the allocator.
    fn free(&self, req: Arc<PeerRequest>);
}

/// Plain heap allocator; never fails.
pub struct HeapAllocator;

impl PeerRequestAllocator for HeapAllocator {
    fn alloc(
        &self,
        minor: u32,
        block_id: u64,
        sector: u64,
        size: u32,
    ) -> Option<Arc<PeerRequest>> {
        Some(Arc::new(PeerRequest::new(minor, block_id, sector, size)))
    }

    fn free(&self, _req: Arc<PeerRequest>) {}
}

/// Primary-side request mirroring one application bio.
pub struct Request {
    /// Owning device minor
    pub minor: u32,
    /// First sector
    pub sector: u64,
    /// Size in bytes
    pub size: u32,
    /// Write (vs read) direction of the master bio
    pub write: bool,
    /// The interval is covered by an active activity-log extent
    pub in_act_log: bool,
    /// Master-bio payload for writes; reads carry none
    pub payload: Option<Bytes>,
}

/// Events applied to the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqEvent {
    /// Local I/O finished without error
    CompletedOk,
    /// Local write failed
    WriteCompletedWithError,
    /// Local read failed
    ReadCompletedWithError,
    /// Local read-ahead failed
    ReadAheadCompletedWithError,
    /// The network send was cancelled (connection going down)
    SendCanceled,
    /// The network send failed
    SendFailed,
    /// Packet handed to the transport
    HandedOverToNetwork,
    /// Out-of-sync notice handed to the transport
    OosHandedToNetwork,
    /// Remote read retry cancelled (peer disk no longer current)
    ReadRetryRemoteCanceled,
}

/// Completion of the master bio, to be run outside the request lock.
pub type MasterBioCompletion = Box<dyn FnOnce() + Send>;

/// External request state machine. Implementations apply the event under
/// their own locking and hand back the master-bio completion when the
/// event released it.
pub trait RequestStateMachine: Send + Sync {
    /// Apply `what` to `req`.
    fn apply(&self, req: &Arc<Request>, what: ReqEvent) -> Option<MasterBioCompletion>;
}

/// State machine that swallows events. Useful as a default and in tests
/// that only observe the wire.
pub struct NullRequestStateMachine;

impl RequestStateMachine for NullRequestStateMachine {
    fn apply(&self, _req: &Arc<Request>, _what: ReqEvent) -> Option<MasterBioCompletion> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_ops() {
        let req = PeerRequest::new(0, ID_SYNCER, 0, 4096);
        assert!(req.flags().is_empty());
        req.set_flags(EeFlags::WAS_ERROR | EeFlags::IS_BARRIER);
        assert!(req.flags().contains(EeFlags::WAS_ERROR));
        req.clear_flags(EeFlags::WAS_ERROR);
        assert!(!req.flags().contains(EeFlags::WAS_ERROR));
        assert!(req.flags().contains(EeFlags::IS_BARRIER));
    }

    #[test]
    fn test_failed_barrier_pattern() {
        let req = PeerRequest::new(0, 1, 0, 4096);
        assert!(!req.is_failed_barrier());
        req.set_flags(EeFlags::IS_BARRIER | EeFlags::WAS_ERROR);
        assert!(req.is_failed_barrier());
        req.set_flags(EeFlags::RESUBMITTED);
        assert!(!req.is_failed_barrier());
    }
}
