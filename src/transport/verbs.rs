//! Verbs and connection-manager surface consumed by the RDMA transport.
//!
//! The transport is written against these traits so the data path can be
//! exercised against the in-memory device in [`super::softdev`] and bound
//! to real hardware verbs elsewhere. Handles are plain integers the way
//! the C verbs API hands out opaque pointers.

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::Result;

/// Work-request id, chosen by the poster, echoed in the completion.
pub type WrId = u64;

/// Connection-manager events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    /// Peer address resolved
    AddrResolved,
    /// Route to the peer resolved
    RouteResolved,
    /// Incoming connection request (listener side)
    ConnectRequest,
    /// Connection established
    Established,
    /// Peer disconnected
    Disconnected,
    /// Address resolution failed
    AddrError,
    /// Route resolution failed
    RouteError,
    /// Connection attempt failed
    ConnectError,
    /// Peer unreachable
    Unreachable,
    /// Peer rejected the connection
    Rejected,
    /// The RDMA device is going away
    DeviceRemoval,
}

/// Status of a completion-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    /// Operation completed successfully
    Success,
    /// Local length error
    LocLenErr,
    /// Local protection error
    LocProtErr,
    /// Work request flushed (QP entered error state)
    WrFlushErr,
    /// Remote operation error
    RemOpErr,
    /// Any other failure
    GeneralErr,
}

/// Opcode of a completion-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// Send request completed
    Send,
    /// Receive request completed
    Recv,
    /// One-sided write completed
    RdmaWrite,
    /// One-sided read completed
    RdmaRead,
}

/// One completion-queue entry.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// Id of the completed work request
    pub wr_id: WrId,
    /// Completion status
    pub status: WcStatus,
    /// Completed operation
    pub opcode: WcOpcode,
    /// Bytes transferred (receives)
    pub byte_len: u32,
}

/// Direction of a DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device writes, host reads (receive landing buffer)
    FromDevice,
    /// Host writes, device reads (send staging buffer)
    ToDevice,
}

bitflags! {
    /// Memory-region access rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MrAccess: u32 {
        /// Local write access
        const LOCAL_WRITE = 1 << 0;
        /// Remote read access
        const REMOTE_READ = 1 << 1;
        /// Remote write access
        const REMOTE_WRITE = 1 << 2;
    }
}

/// Protection-domain handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdHandle(pub u32);

/// Completion-queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqHandle(pub u32);

/// Queue-pair handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpHandle(pub u32);

/// Memory-region handle carrying the local key for SG entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle {
    /// Local key
    pub lkey: u32,
}

/// One scatter-gather element.
#[derive(Debug, Clone, Copy)]
pub struct SgEntry {
    /// DMA address of the buffer
    pub addr: u64,
    /// Length in bytes
    pub length: u32,
    /// Local key of the covering memory region
    pub lkey: u32,
}

/// A SEND work request.
#[derive(Debug, Clone, Copy)]
pub struct SendRequest {
    /// Completion correlation id
    pub wr_id: WrId,
    /// Source buffer
    pub sge: SgEntry,
    /// Request a completion entry
    pub signaled: bool,
}

/// A receive work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvRequest {
    /// Completion correlation id
    pub wr_id: WrId,
    /// Landing buffer
    pub sge: SgEntry,
}

/// Queue-pair creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct QpInitAttrs {
    /// Send queue depth
    pub max_send_wr: usize,
    /// Receive queue depth
    pub max_recv_wr: usize,
    /// Send completion queue
    pub send_cq: CqHandle,
    /// Receive completion queue
    pub recv_cq: CqHandle,
}

/// Connection parameters for `connect`/`accept`.
#[derive(Debug, Clone, Copy)]
pub struct ConnParam {
    /// RDMA-read resources offered to the peer
    pub responder_resources: u8,
    /// RDMA-read depth requested from the peer
    pub initiator_depth: u8,
    /// Transport-level retry count
    pub retry_count: u8,
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 10,
        }
    }
}

/// Host memory pinned for device access.
///
/// Receive buffers start as writable landing space the device fills;
/// after the completion is harvested the host freezes them into immutable
/// views. Send buffers wrap an immutable payload the device reads.
pub struct DmaBuffer {
    inner: Mutex<DmaBufferInner>,
}

enum DmaBufferInner {
    Recv(Option<BytesMut>),
    Send(Bytes),
}

impl DmaBuffer {
    /// Allocate a zeroed landing buffer of `len` bytes.
    pub fn for_recv(len: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(DmaBufferInner::Recv(Some(BytesMut::zeroed(len)))),
        })
    }

    /// Wrap an immutable send payload.
    pub fn for_send(data: Bytes) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(DmaBufferInner::Send(data)),
        })
    }

    /// Device side: fill the landing buffer. Returns bytes written.
    pub fn device_write(&self, payload: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        match &mut *inner {
            DmaBufferInner::Recv(Some(buf)) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                n
            }
            _ => 0,
        }
    }

    /// Device side: read the send payload.
    pub fn device_read(&self) -> Bytes {
        let inner = self.inner.lock();
        match &*inner {
            DmaBufferInner::Send(data) => data.clone(),
            DmaBufferInner::Recv(_) => Bytes::new(),
        }
    }

    /// Host side: freeze the first `len` received bytes into a view.
    /// The landing space is gone afterwards; a fresh buffer is allocated
    /// for the replacement descriptor.
    pub fn take_received(&self, len: usize) -> Bytes {
        let mut inner = self.inner.lock();
        match &mut *inner {
            DmaBufferInner::Recv(slot) => match slot.take() {
                Some(buf) => {
                    let len = len.min(buf.len());
                    buf.freeze().slice(..len)
                }
                None => Bytes::new(),
            },
            DmaBufferInner::Send(_) => Bytes::new(),
        }
    }
}

/// Completion-queue notification callback, invoked from the device's
/// completion context. Must not block.
pub type CqNotify = Arc<dyn Fn() + Send + Sync>;

/// The verbs surface of one RDMA device.
pub trait VerbsDevice: Send + Sync {
    /// Allocate a protection domain.
    fn alloc_pd(&self) -> Result<PdHandle>;

    /// Create a completion queue of `depth` entries with a notification
    /// callback.
    fn create_cq(&self, depth: usize, notify: CqNotify) -> Result<CqHandle>;

    /// Request a notification for the next completion.
    fn req_notify_cq(&self, cq: CqHandle) -> Result<()>;

    /// Poll one completion, if any.
    fn poll_cq(&self, cq: CqHandle) -> Option<WorkCompletion>;

    /// Create a queue pair.
    fn create_qp(&self, pd: PdHandle, attrs: QpInitAttrs) -> Result<QpHandle>;

    /// Register all host memory for DMA with the given access rights.
    fn get_dma_mr(&self, pd: PdHandle, access: MrAccess) -> Result<MrHandle>;

    /// Map a buffer for device access, returning its DMA address.
    fn dma_map(&self, buf: &Arc<DmaBuffer>, dir: DmaDirection) -> u64;

    /// Drop a DMA mapping.
    fn dma_unmap(&self, addr: u64);

    /// Make device writes visible to the CPU.
    fn dma_sync_for_cpu(&self, addr: u64);

    /// Make CPU writes visible to the device.
    fn dma_sync_for_device(&self, addr: u64);

    /// Post a receive work request.
    fn post_recv(&self, qp: QpHandle, wr: RecvRequest) -> Result<()>;

    /// Post a send work request.
    fn post_send(&self, qp: QpHandle, wr: SendRequest) -> Result<()>;

    /// Destroy a queue pair.
    fn destroy_qp(&self, qp: QpHandle);

    /// Destroy a completion queue.
    fn destroy_cq(&self, cq: CqHandle);

    /// Deallocate a protection domain.
    fn dealloc_pd(&self, pd: PdHandle);

    /// Deregister a memory region.
    fn dereg_mr(&self, mr: MrHandle);
}

/// Sink for connection-manager events. On `ConnectRequest` the id argument
/// is the child id of the incoming connection, otherwise the id the event
/// belongs to.
pub trait CmEventHandler: Send + Sync {
    /// Deliver one event. Runs in the connection manager's context and
    /// must not block.
    fn on_event(&self, id: &Arc<dyn CmId>, event: CmEvent, status: i32);
}

/// One connection-manager identifier.
pub trait CmId: Send + Sync {
    /// Start address resolution towards `addr`.
    fn resolve_addr(&self, addr: &str, timeout_ms: u64) -> Result<()>;

    /// Start route resolution.
    fn resolve_route(&self, timeout_ms: u64) -> Result<()>;

    /// Initiate the connection (active side).
    fn connect(&self, param: &ConnParam) -> Result<()>;

    /// Bind to a local address (passive side).
    fn bind_addr(&self, addr: &str) -> Result<()>;

    /// Start listening.
    fn listen(&self, backlog: usize) -> Result<()>;

    /// Accept an incoming connection (on the child id).
    fn accept(&self, param: &ConnParam) -> Result<()>;

    /// The device this id is bound to.
    fn device(&self) -> Arc<dyn VerbsDevice>;

    /// Destroy the id, disconnecting if connected.
    fn destroy(&self);
}

/// Connection-manager entry point: id creation with an event sink.
pub trait ConnectionManager: Send + Sync {
    /// Create a connection-manager id delivering events to `handler`.
    fn create_id(&self, handler: Arc<dyn CmEventHandler>) -> Result<Arc<dyn CmId>>;
}
