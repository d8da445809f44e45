//! Connection context shared by the worker and the endio dispatch.
//!
//! One connection owns the work queue, the transport, the peer-request
//! lists (under the request lock), the connection-level state, and the
//! protocol send helpers the worker callbacks use. It also carries the
//! collaborator handles (request state machine, helper runner, allocator)
//! and the engine services (registry, timers, metrics).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::device::{Device, DeviceFlags, Registry};
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::protocol::{self, BlockHeader, MessageType};
use crate::requests::{
    PeerRequest, PeerRequestAllocator, Request, RequestStateMachine, ID_SYNCER,
};
use crate::state::{ConnState, Helper, StateFlags};
use crate::timer::{TimerKey, TimerKind, TimerService};
use crate::transport::{StreamKind, Transport};
use crate::work::WorkItem;
use crate::worker::WorkQueue;

/// Write-ordering regimes, strongest last. A failed barrier downgrades
/// the regime to explicit flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteOrdering {
    /// No ordering enforcement
    None,
    /// Drain the queue between epochs
    Drain,
    /// Explicit flushes between epochs
    BdevFlush,
    /// Barrier requests
    Barrier,
}

/// The peer-request lists, protected by the request lock.
#[derive(Default)]
pub struct EeLists {
    /// Replicated writes in flight
    pub active_ee: VecDeque<Arc<PeerRequest>>,
    /// Resync writes in flight
    pub sync_ee: VecDeque<Arc<PeerRequest>>,
    /// Reads on behalf of the peer in flight
    pub read_ee: VecDeque<Arc<PeerRequest>>,
    /// Completed requests waiting for their ack to go out
    pub done_ee: VecDeque<Arc<PeerRequest>>,
    /// Requests whose pages may still sit in the transport
    pub net_ee: VecDeque<Arc<PeerRequest>>,
}

/// Remove `req` from `list` by identity. Returns true when found.
pub fn ee_remove(list: &mut VecDeque<Arc<PeerRequest>>, req: &Arc<PeerRequest>) -> bool {
    if let Some(idx) = list.iter().position(|e| Arc::ptr_eq(e, req)) {
        list.remove(idx);
        true
    } else {
        false
    }
}

/// One replication connection.
pub struct Connection {
    /// Device directory
    pub registry: Arc<Registry>,
    /// The worker's queue
    pub queue: Arc<WorkQueue>,
    /// The replication link
    pub transport: Arc<dyn Transport>,
    /// Timer service
    pub timers: Arc<TimerService>,
    /// Engine counters
    pub metrics: Arc<EngineMetrics>,

    cstate: Mutex<ConnState>,
    /// Protocol version agreed with the peer
    pub agreed_pro_version: AtomicU32,
    /// Keepalive interval in milliseconds
    ping_int_ms: AtomicU64,
    /// Keepalive answer timeout in milliseconds
    ping_timeo_ms: AtomicU64,

    ee: Mutex<EeLists>,
    ee_cv: Condvar,

    /// Serializes send-socket manipulation (corking)
    pub data_mutex: Mutex<()>,

    write_ordering: Mutex<WriteOrdering>,

    devices: Mutex<Vec<Arc<Device>>>,

    got_ping_ack: AtomicBool,
    ping_lock: Mutex<()>,
    ping_cv: Condvar,

    asender_kick: Mutex<bool>,
    asender_cv: Condvar,

    /// Request state machine collaborator
    pub req_sm: Arc<dyn RequestStateMachine>,
    /// Event-handler subprocess runner
    pub helper: Arc<dyn Helper>,
    /// Peer-request allocator
    pub allocator: Arc<dyn PeerRequestAllocator>,
}

impl Connection {
    /// Assemble a connection around its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        timers: Arc<TimerService>,
        req_sm: Arc<dyn RequestStateMachine>,
        helper: Arc<dyn Helper>,
        allocator: Arc<dyn PeerRequestAllocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue: Arc::new(WorkQueue::new()),
            transport,
            timers,
            metrics: Arc::new(EngineMetrics::new()),
            cstate: Mutex::new(ConnState::StandAlone),
            agreed_pro_version: AtomicU32::new(80),
            ping_int_ms: AtomicU64::new(10_000),
            ping_timeo_ms: AtomicU64::new(500),
            ee: Mutex::new(EeLists::default()),
            ee_cv: Condvar::new(),
            data_mutex: Mutex::new(()),
            write_ordering: Mutex::new(WriteOrdering::Barrier),
            devices: Mutex::new(Vec::new()),
            got_ping_ack: AtomicBool::new(false),
            ping_lock: Mutex::new(()),
            ping_cv: Condvar::new(),
            asender_kick: Mutex::new(false),
            asender_cv: Condvar::new(),
            req_sm,
            helper,
            allocator,
        })
    }

    /// Attach a device to this connection.
    pub fn add_device(&self, device: Arc<Device>) {
        self.registry.insert(device.clone());
        self.devices.lock().push(device);
    }

    /// Devices attached to this connection.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().clone()
    }

    /// Snapshot the engine counters plus the live work-queue depth.
    pub fn metrics_snapshot(&self) -> std::collections::HashMap<String, u64> {
        let mut snapshot = self.metrics.snapshot();
        snapshot.insert("queue_depth".to_string(), self.queue.len() as u64);
        snapshot
    }

    /// Connection-level state.
    pub fn cstate(&self) -> ConnState {
        *self.cstate.lock()
    }

    /// Request a connection-wide state transition.
    pub fn request_state(&self, target: ConnState, flags: StateFlags) {
        let mut cstate = self.cstate.lock();
        if *cstate == target {
            return;
        }
        if flags.contains(StateFlags::VERBOSE) || flags.contains(StateFlags::HARD) {
            debug!(from = ?*cstate, to = ?target, "connection state change");
        }
        *cstate = target;
    }

    /// The request lock: access to the peer-request lists.
    pub fn ee(&self) -> MutexGuard<'_, EeLists> {
        self.ee.lock()
    }

    /// Wake threads waiting for an ee list to drain.
    pub fn wake_ee_waiters(&self) {
        self.ee_cv.notify_all();
    }

    /// Wait until all in-flight ee lists (active, sync, read) are empty.
    /// Used by the receiver side around epoch changes and teardown.
    pub fn wait_ee_lists_empty(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut ee = self.ee.lock();
        loop {
            if ee.active_ee.is_empty() && ee.sync_ee.is_empty() && ee.read_ee.is_empty() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.ee_cv.wait_for(&mut ee, remaining);
        }
    }

    /// Wake the ack-sender.
    pub fn wake_asender(&self) {
        let mut kicked = self.asender_kick.lock();
        *kicked = true;
        self.asender_cv.notify_all();
    }

    /// Wait for an ack-sender kick (consumes it). For the receiver side
    /// and for tests.
    pub fn wait_asender_kick(&self, timeout: Duration) -> bool {
        let mut kicked = self.asender_kick.lock();
        if !*kicked {
            self.asender_cv.wait_for(&mut kicked, timeout);
        }
        std::mem::replace(&mut *kicked, false)
    }

    /// Current write-ordering regime.
    pub fn write_ordering(&self) -> WriteOrdering {
        *self.write_ordering.lock()
    }

    /// Downgrade the write-ordering regime (never upgrades).
    pub fn bump_write_ordering(&self, wo: WriteOrdering) {
        let mut current = self.write_ordering.lock();
        if wo < *current {
            warn!(from = ?*current, to = ?wo, "downgrading write ordering");
            *current = wo;
        }
    }

    // ---- ping ---------------------------------------------------------

    /// Configure the keepalive interval and answer timeout.
    pub fn set_ping_parameters(&self, ping_int: Duration, ping_timeo: Duration) {
        self.ping_int_ms
            .store(ping_int.as_millis() as u64, Ordering::Release);
        self.ping_timeo_ms
            .store(ping_timeo.as_millis() as u64, Ordering::Release);
    }

    /// Keepalive interval.
    pub fn ping_int(&self) -> Duration {
        Duration::from_millis(self.ping_int_ms.load(Ordering::Acquire))
    }

    /// Keepalive answer timeout.
    pub fn ping_timeo(&self) -> Duration {
        Duration::from_millis(self.ping_timeo_ms.load(Ordering::Acquire))
    }

    /// Deliver a ping ack (called by the receive path).
    pub fn got_ping_ack(&self) {
        self.got_ping_ack.store(true, Ordering::Release);
        let _guard = self.ping_lock.lock();
        self.ping_cv.notify_all();
    }

    /// Send a ping and wait for the ack or for the device's connection to
    /// go down.
    pub fn ping_peer(&self, device: &Device) {
        self.got_ping_ack.store(false, Ordering::Release);
        if let Err(e) = self.send_control(protocol::encode_empty(MessageType::Ping).freeze()) {
            debug!(error = %e, "ping send failed");
            return;
        }
        let mut guard = self.ping_lock.lock();
        loop {
            if self.got_ping_ack.load(Ordering::Acquire)
                || device.state().conn < ConnState::Connected
            {
                return;
            }
            self.ping_cv.wait_for(&mut guard, Duration::from_millis(20));
        }
    }

    // ---- timers -------------------------------------------------------

    /// Arm the resync timer: after `delay` a resync tick is queued unless
    /// one is already pending.
    pub fn arm_resync_timer(self: &Arc<Self>, device: &Arc<Device>, delay: Duration) {
        let key = TimerKey {
            minor: device.minor,
            kind: TimerKind::Resync,
        };
        let conn = self.clone();
        let device = device.clone();
        self.timers.arm(key, delay, move || {
            if !device.test_and_set_flags(DeviceFlags::RESYNC_QUEUED) {
                conn.queue.queue(WorkItem::ResyncTick {
                    device: device.clone(),
                });
            }
        });
    }

    /// Arm the deferred start-of-resync timer.
    pub fn arm_start_resync_timer(
        self: &Arc<Self>,
        device: &Arc<Device>,
        side: ConnState,
        delay: Duration,
    ) {
        let key = TimerKey {
            minor: device.minor,
            kind: TimerKind::StartResync,
        };
        let conn = self.clone();
        let device = device.clone();
        self.timers.arm(key, delay, move || {
            conn.queue.queue(WorkItem::StartResync {
                device: device.clone(),
                side,
            });
        });
    }

    // ---- protocol send helpers ----------------------------------------

    fn send_data(&self, frame: Bytes) -> Result<usize> {
        let _guard = self.data_mutex.lock();
        self.transport.send(StreamKind::Data, &frame)
    }

    fn send_control(&self, frame: Bytes) -> Result<usize> {
        self.transport.send(StreamKind::Control, &frame)
    }

    /// Send a block request (read, resync read, verify) on the data
    /// stream.
    pub fn send_drequest(
        &self,
        cmd: MessageType,
        sector: u64,
        size: u32,
        block_id: u64,
    ) -> Result<()> {
        let bh = BlockHeader {
            sector,
            block_id,
            size,
        };
        self.send_data(protocol::encode_block_request(cmd, &bh).freeze())
            .map(|_| ())
    }

    /// Send a digest-carrying request on the data stream.
    pub fn send_drequest_csum(
        &self,
        cmd: MessageType,
        sector: u64,
        size: u32,
        digest: &[u8],
    ) -> Result<()> {
        let bh = BlockHeader {
            sector,
            block_id: ID_SYNCER,
            size,
        };
        self.send_data(protocol::encode_digest_request(cmd, &bh, digest).freeze())
            .map(|_| ())
    }

    /// Send an ack for a peer request on the control stream.
    pub fn send_ack(&self, cmd: MessageType, peer_req: &PeerRequest) -> Result<()> {
        let bh = BlockHeader {
            sector: peer_req.sector,
            block_id: peer_req.block_id.load(Ordering::Acquire),
            size: peer_req.size,
        };
        self.send_control(protocol::encode_block_request(cmd, &bh).freeze())
            .map(|_| ())
    }

    /// Send an explicit ack on the control stream.
    pub fn send_ack_ex(
        &self,
        cmd: MessageType,
        sector: u64,
        size: u32,
        block_id: u64,
    ) -> Result<()> {
        let bh = BlockHeader {
            sector,
            block_id,
            size,
        };
        self.send_control(protocol::encode_block_request(cmd, &bh).freeze())
            .map(|_| ())
    }

    /// Send a data-bearing reply: header on the data stream, then the
    /// pages through the zero-copy page path.
    pub fn send_block(
        &self,
        device: &Device,
        cmd: MessageType,
        peer_req: &PeerRequest,
    ) -> Result<()> {
        let bh = BlockHeader {
            sector: peer_req.sector,
            block_id: peer_req.block_id.load(Ordering::Acquire),
            size: peer_req.size,
        };
        let _guard = self.data_mutex.lock();
        self.transport.send(
            StreamKind::Data,
            &protocol::encode_data_header(cmd, &bh),
        )?;
        let pages = peer_req.pages.lock().clone();
        for page in &pages {
            self.transport
                .send_page(StreamKind::Data, page, 0, page.len())?;
        }
        device
            .send_cnt
            .fetch_add(u64::from(peer_req.size) >> 9, Ordering::Relaxed);
        Ok(())
    }

    /// Mirror an application write to the peer.
    pub fn send_dblock(&self, device: &Device, req: &Request) -> Result<()> {
        let bh = BlockHeader {
            sector: req.sector,
            block_id: req as *const Request as u64,
            size: req.size,
        };
        let _guard = self.data_mutex.lock();
        self.transport.send(
            StreamKind::Data,
            &protocol::encode_data_header(MessageType::Data, &bh),
        )?;
        if let Some(payload) = &req.payload {
            self.transport
                .send_page(StreamKind::Data, payload, 0, payload.len())?;
        }
        device
            .send_cnt
            .fetch_add(u64::from(req.size) >> 9, Ordering::Relaxed);
        Ok(())
    }

    /// Tell the peer an interval went out of sync without sending data.
    pub fn send_out_of_sync(&self, req: &Request) -> Result<()> {
        let bh = BlockHeader {
            sector: req.sector,
            block_id: ID_SYNCER,
            size: req.size,
        };
        self.send_data(protocol::encode_block_request(MessageType::OutOfSync, &bh).freeze())
            .map(|_| ())
    }

    /// Send a write-ordering barrier.
    pub fn send_barrier(&self, barrier_nr: u32) -> Result<()> {
        self.send_data(protocol::encode_barrier(MessageType::Barrier, barrier_nr).freeze())
            .map(|_| ())
    }

    /// Hint the peer to unplug its request queue.
    pub fn send_write_hint(&self) -> Result<()> {
        self.send_data(protocol::encode_empty(MessageType::UnplugRemote).freeze())
            .map(|_| ())
    }

    /// Send an online-verify request.
    pub fn send_ov_request(&self, sector: u64, size: u32) -> Result<()> {
        self.send_drequest(MessageType::OvRequest, sector, size, ID_SYNCER)
    }

    /// Send the sync generation UUID.
    pub fn send_sync_uuid(&self, uuid: u64) -> Result<()> {
        self.send_data(protocol::encode_sync_uuid(uuid).freeze())
            .map(|_| ())
    }

    /// Park a peer request on `net_ee` while its pages may still be in
    /// the transport, or free it.
    pub fn move_to_net_ee_or_free(&self, peer_req: &Arc<PeerRequest>) {
        let has_pages = !peer_req.pages.lock().is_empty();
        if has_pages {
            trace!(sector = peer_req.sector, "parking peer request on net_ee");
            self.ee().net_ee.push_back(peer_req.clone());
        } else {
            self.allocator.free(peer_req.clone());
        }
    }
}
