//! Transport abstraction for the replication link.
//!
//! A transport multiplexes two independent streams over one connection: the
//! DATA stream carries mirrored writes and resync payload, the CONTROL
//! stream carries acks and keepalives. Order is preserved within a stream,
//! never across streams. The replication core holds the transport as a
//! trait object; the RDMA implementation lives in [`rdma`], an in-memory
//! verbs device for tests and development in [`softdev`].

use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;

use crate::error::Result;

pub mod mock;
pub mod rdma;
pub mod softdev;
pub mod verbs;

/// Stream index within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Bulk data: mirrored writes, resync blocks, read replies
    Data = 0,
    /// Control: acks, pings, state packets
    Control = 1,
}

impl StreamKind {
    /// Stable array index.
    pub fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Flags modifying a receive operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecvFlags: u32 {
        /// Extend the previous logical read in place: expose the next bytes
        /// of the same landing buffer; never copies, never waits.
        const GROW_BUFFER = 1 << 0;
    }
}

/// Socket-level tuning hints forwarded to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHint {
    /// Batch small sends
    Cork,
    /// Flush batched sends
    Uncork,
    /// Disable Nagle-style delays
    Nodelay,
    /// Ack received data promptly
    Quickack,
}

/// Teardown granularity for [`Transport::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOp {
    /// Drop the connection but keep the transport reusable
    FreeConnection,
    /// Tear everything down
    DestroyTransport,
}

/// Transport counters reported to the send path.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Received bytes not yet consumed by `recv`
    pub unread_received: usize,
    /// Sends written but not yet acknowledged by the peer
    pub unacked_send: usize,
    /// Capacity of the send buffer, in send slots
    pub send_buffer_size: usize,
    /// Send slots currently in flight
    pub send_buffer_used: usize,
}

/// Peer addressing for the two streams.
#[derive(Debug, Clone)]
pub struct PeerEndpoints {
    /// DATA stream address
    pub data: String,
    /// CONTROL stream address
    pub control: String,
}

/// The byte-stream abstraction the replication protocol consumes.
///
/// `recv` returns reference-counted views into the receive landing buffers;
/// a view stays valid independent of later calls, and a `GROW_BUFFER`
/// receive continues the current landing buffer without waiting.
pub trait Transport: Send + Sync {
    /// Establish both streams (role and endpoints fixed at construction).
    fn connect(&self) -> Result<()>;

    /// Queue `data` on `stream`. Returns the number of bytes accepted.
    fn send(&self, stream: StreamKind, data: &[u8]) -> Result<usize>;

    /// Receive exactly `size` bytes from `stream` as a zero-copy view
    /// where possible. Times out with [`crate::error::Error::WouldBlock`]
    /// after the stream's receive timeout.
    fn recv(&self, stream: StreamKind, size: usize, flags: RecvFlags) -> Result<Bytes>;

    /// Receive exactly `buf.len()` bytes, copied into caller storage.
    fn recv_into(&self, stream: StreamKind, buf: &mut [u8]) -> Result<usize>;

    /// Queue a slice of a page without copying. Returns bytes accepted.
    fn send_page(
        &self,
        stream: StreamKind,
        page: &Bytes,
        offset: usize,
        size: usize,
    ) -> Result<usize>;

    /// Gather `size` bytes of DATA-stream payload into page-sized chunks,
    /// consuming whole landing buffers where possible.
    fn recv_pages(&self, size: usize) -> Result<Vec<Bytes>>;

    /// Current transport counters.
    fn stats(&self) -> TransportStats;

    /// Set the receive timeout for one stream.
    fn set_rcvtimeo(&self, stream: StreamKind, timeout: Duration);

    /// Get the receive timeout for one stream.
    fn get_rcvtimeo(&self, stream: StreamKind) -> Duration;

    /// True iff the stream exists and holds a live connection.
    fn stream_ok(&self, stream: StreamKind) -> bool;

    /// Apply a tuning hint. Returns false only when the hint was attempted
    /// and failed; unsupported hints report true.
    fn hint(&self, stream: StreamKind, hint: TransportHint) -> bool;

    /// Tear the transport down.
    fn free(&self, op: FreeOp);
}
