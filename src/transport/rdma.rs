//! RDMA transport: two reliable byte streams over send/receive verbs.
//!
//! Each stream owns its connection-manager id, protection domain, queue
//! pair, one completion queue per direction, and a ring of page-sized
//! receive landing buffers kept posted on the receive queue. Variable-size
//! logical messages are presented over those fixed-size buffers: `recv`
//! hands out reference-counted views into the current landing buffer and
//! only falls back to assembly when a read spans buffers.
//!
//! Only two-sided SEND/RECV is used; one-sided READ/WRITE is a possible
//! future extension.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::{ConnectRole, TransportConfig};
use crate::error::{Error, Result};
use crate::transport::verbs::{
    CmEvent, CmEventHandler, CmId, ConnParam, ConnectionManager, CqHandle, DmaBuffer,
    DmaDirection, MrAccess, MrHandle, PdHandle, QpHandle, QpInitAttrs, RecvRequest, SendRequest,
    SgEntry, VerbsDevice, WcOpcode, WcStatus, WorkCompletion, WrId,
};
use crate::transport::{
    FreeOp, PeerEndpoints, RecvFlags, StreamKind, Transport, TransportHint, TransportStats,
};

/// Stream connection state, ordered so callers can wait for "at least".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum StreamState {
    Idle,
    ConnectRequest,
    AddrResolved,
    RouteResolved,
    Connected,
    Disconnected,
    Error,
}

/// A harvested receive landing buffer being consumed by `recv`.
struct RxDesc {
    /// Frozen landing-buffer contents
    data: Bytes,
    /// Read cursor
    pos: usize,
    /// Bytes not yet consumed; 0 means the descriptor is spent
    xfer_len: usize,
}

/// A posted receive awaiting completion.
struct RxPending {
    buf: Arc<DmaBuffer>,
    dma_addr: u64,
}

/// A posted send awaiting its completion (staging buffer kept alive).
struct TxPending {
    _buf: Arc<DmaBuffer>,
    dma_addr: u64,
}

struct StreamResources {
    device: Arc<dyn VerbsDevice>,
    pd: PdHandle,
    recv_cq: CqHandle,
    send_cq: CqHandle,
    qp: QpHandle,
    mr: MrHandle,
}

struct RecvShared {
    /// Completed descriptors not yet picked up as current
    ready: std::collections::VecDeque<RxDesc>,
    /// The descriptor `recv` is currently consuming
    current: Option<RxDesc>,
}

/// One RDMA stream: connection state machine, descriptor rings, pumps.
pub struct RdmaStream {
    kind: StreamKind,
    max_rx: usize,
    max_tx: usize,
    page_size: usize,
    resolve_timeout_ms: u64,

    state: Mutex<StreamState>,
    state_cv: Condvar,

    recv_shared: Mutex<RecvShared>,
    recv_cv: Condvar,
    recv_timeout: Mutex<Duration>,

    /// Set on teardown; wakes and fails all blocking waits
    intr: AtomicBool,

    cm_id: Mutex<Option<Arc<dyn CmId>>>,
    child_cm_id: Mutex<Option<Arc<dyn CmId>>>,
    res: Mutex<Option<StreamResources>>,

    post_recv_count: AtomicI64,
    post_send_count: AtomicI64,

    posted_rx: Mutex<HashMap<WrId, RxPending>>,
    pending_tx: Mutex<HashMap<WrId, TxPending>>,
    next_wr_id: AtomicU64,
}

impl RdmaStream {
    fn new(kind: StreamKind, config: &TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            kind,
            max_rx: config.max_rx,
            max_tx: config.max_tx,
            page_size: config.page_size,
            resolve_timeout_ms: config.resolve_timeout_ms,
            state: Mutex::new(StreamState::Idle),
            state_cv: Condvar::new(),
            recv_shared: Mutex::new(RecvShared {
                ready: std::collections::VecDeque::new(),
                current: None,
            }),
            recv_cv: Condvar::new(),
            recv_timeout: Mutex::new(Duration::from_millis(config.recv_timeout_ms)),
            intr: AtomicBool::new(false),
            cm_id: Mutex::new(None),
            child_cm_id: Mutex::new(None),
            res: Mutex::new(None),
            post_recv_count: AtomicI64::new(0),
            post_send_count: AtomicI64::new(0),
            posted_rx: Mutex::new(HashMap::new()),
            pending_tx: Mutex::new(HashMap::new()),
            next_wr_id: AtomicU64::new(1),
        })
    }

    fn name(&self) -> &'static str {
        match self.kind {
            StreamKind::Data => "data",
            StreamKind::Control => "control",
        }
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
        self.state_cv.notify_all();
    }

    fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Block until the state reaches at least `want`; `Error` and
    /// `Disconnected` order above every wait target and fail the check in
    /// the caller.
    fn wait_state_at_least(&self, want: StreamState) -> StreamState {
        let mut state = self.state.lock();
        while *state < want && !self.intr.load(Ordering::Acquire) {
            self.state_cv.wait(&mut state);
        }
        *state
    }

    fn ok(&self) -> bool {
        self.cm_id.lock().is_some()
    }

    // ---- connection establishment -------------------------------------

    fn create_cm_id(self: &Arc<Self>, cm: &Arc<dyn ConnectionManager>) -> Result<()> {
        self.set_state(StreamState::Idle);
        let id = cm.create_id(self.clone() as Arc<dyn CmEventHandler>)?;
        debug!(stream = self.name(), "created cm id");
        *self.cm_id.lock() = Some(id);
        Ok(())
    }

    /// Active side: resolve, allocate, connect.
    fn connect_stream(self: &Arc<Self>, cm: &Arc<dyn ConnectionManager>, addr: &str) -> Result<()> {
        debug!(stream = self.name(), addr, "entering connect");
        self.create_cm_id(cm)?;

        let cm_id = self.cm_id.lock().clone().expect("cm id just created");
        cm_id.resolve_addr(addr, self.resolve_timeout_ms)?;

        let reached = self.wait_state_at_least(StreamState::RouteResolved);
        if reached != StreamState::RouteResolved {
            warn!(stream = self.name(), state = ?reached, "addr/route resolution failed");
            return Err(Error::disconnected("address or route resolution failed"));
        }

        self.alloc_rdma_resources()?;

        cm_id.connect(&ConnParam::default())?;

        let reached = self.wait_state_at_least(StreamState::Connected);
        if reached != StreamState::Connected {
            warn!(stream = self.name(), state = ?reached, "connect failed");
            return Err(Error::disconnected("stream connect failed"));
        }
        debug!(stream = self.name(), "connect successful");
        Ok(())
    }

    /// Passive side: bind, listen, accept.
    fn listen_stream(self: &Arc<Self>, cm: &Arc<dyn ConnectionManager>, addr: &str) -> Result<()> {
        debug!(stream = self.name(), addr, "entering bind/listen/accept");
        self.create_cm_id(cm)?;

        let listen_id = self.cm_id.lock().clone().expect("cm id just created");
        listen_id.bind_addr(addr)?;
        listen_id.listen(3)?;

        let reached = self.wait_state_at_least(StreamState::ConnectRequest);
        if reached != StreamState::ConnectRequest {
            warn!(stream = self.name(), state = ?reached, "no connect request");
            return Err(Error::disconnected("listen failed"));
        }

        // The child id carries the actual connection; the listening id is
        // done.
        listen_id.destroy();
        let child = self.child_cm_id.lock().take();
        *self.cm_id.lock() = child;
        if self.cm_id.lock().is_none() {
            return Err(Error::disconnected("connect request without child id"));
        }

        self.alloc_rdma_resources()?;

        let cm_id = self.cm_id.lock().clone().expect("child id installed");
        cm_id.accept(&ConnParam {
            retry_count: 0,
            ..ConnParam::default()
        })?;

        let reached = self.wait_state_at_least(StreamState::Connected);
        if reached != StreamState::Connected {
            warn!(stream = self.name(), state = ?reached, "accept failed");
            return Err(Error::disconnected("stream accept failed"));
        }
        debug!(stream = self.name(), "connection accepted");
        Ok(())
    }

    /// Allocate PD, CQs, QP and MR, then fill the receive ring.
    /// Unwinds in reverse order on failure.
    fn alloc_rdma_resources(self: &Arc<Self>) -> Result<()> {
        let cm_id = self
            .cm_id
            .lock()
            .clone()
            .ok_or_else(|| Error::disconnected("no cm id"))?;
        let device = cm_id.device();

        let pd = device.alloc_pd()?;

        let weak_rx: Weak<RdmaStream> = Arc::downgrade(self);
        let recv_cq = match device.create_cq(
            self.max_rx,
            Arc::new(move || {
                if let Some(stream) = weak_rx.upgrade() {
                    stream.rx_cq_event();
                }
            }),
        ) {
            Ok(cq) => cq,
            Err(e) => {
                device.dealloc_pd(pd);
                return Err(e);
            }
        };

        let weak_tx: Weak<RdmaStream> = Arc::downgrade(self);
        let send_cq = match device.create_cq(
            self.max_tx,
            Arc::new(move || {
                if let Some(stream) = weak_tx.upgrade() {
                    stream.tx_cq_event();
                }
            }),
        ) {
            Ok(cq) => cq,
            Err(e) => {
                device.destroy_cq(recv_cq);
                device.dealloc_pd(pd);
                return Err(e);
            }
        };

        let armed = device
            .req_notify_cq(recv_cq)
            .and_then(|()| device.req_notify_cq(send_cq));
        let qp = armed.and_then(|()| {
            device.create_qp(
                pd,
                QpInitAttrs {
                    max_send_wr: self.max_tx,
                    max_recv_wr: self.max_rx,
                    send_cq,
                    recv_cq,
                },
            )
        });
        let qp = match qp {
            Ok(qp) => qp,
            Err(e) => {
                device.destroy_cq(send_cq);
                device.destroy_cq(recv_cq);
                device.dealloc_pd(pd);
                return Err(e);
            }
        };

        let mr = match device.get_dma_mr(
            pd,
            MrAccess::LOCAL_WRITE | MrAccess::REMOTE_READ | MrAccess::REMOTE_WRITE,
        ) {
            Ok(mr) => mr,
            Err(e) => {
                device.destroy_qp(qp);
                device.destroy_cq(send_cq);
                device.destroy_cq(recv_cq);
                device.dealloc_pd(pd);
                return Err(e);
            }
        };

        *self.res.lock() = Some(StreamResources {
            device,
            pd,
            recv_cq,
            send_cq,
            qp,
            mr,
        });

        for _ in 0..self.max_rx {
            if let Err(e) = self.create_and_post_rx_desc() {
                warn!(stream = self.name(), error = %e, "failed posting rx desc");
                break;
            }
        }

        Ok(())
    }

    // ---- RX descriptor ring (C2) --------------------------------------

    /// Allocate one landing buffer, map it, and post it to the receive
    /// queue. On post failure the descriptor is dropped and the posted
    /// count rolled back.
    fn create_and_post_rx_desc(&self) -> Result<()> {
        // Clone the handles out so no stream lock is held across the post:
        // the device may deliver completions (and run the pumps)
        // synchronously from `post_recv`.
        let (device, qp, lkey) = {
            let res = self.res.lock();
            let res = res
                .as_ref()
                .ok_or_else(|| Error::disconnected("stream has no resources"))?;
            (res.device.clone(), res.qp, res.mr.lkey)
        };

        let buf = DmaBuffer::for_recv(self.page_size);
        let dma_addr = device.dma_map(&buf, DmaDirection::FromDevice);
        let sge = SgEntry {
            addr: dma_addr,
            length: self.page_size as u32,
            lkey,
        };
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);

        self.posted_rx.lock().insert(wr_id, RxPending { buf, dma_addr });
        device.dma_sync_for_device(dma_addr);
        self.post_recv_count.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = device.post_recv(qp, RecvRequest { wr_id, sge }) {
            self.post_recv_count.fetch_sub(1, Ordering::AcqRel);
            if let Some(pending) = self.posted_rx.lock().remove(&wr_id) {
                device.dma_unmap(pending.dma_addr);
            }
            warn!(stream = self.name(), error = %e, "post_recv failed");
            return Err(e);
        }
        Ok(())
    }

    // ---- TX descriptor path (C3) --------------------------------------

    /// Stage `payload` into a pinned buffer and post a signalled SEND.
    /// The staging buffer stays alive until the TX pump reaps the
    /// completion.
    fn create_and_post_tx_desc(&self, payload: Bytes) -> Result<()> {
        if payload.len() > self.page_size {
            return Err(Error::protocol("tx payload exceeds landing-buffer size"));
        }
        let (device, qp, lkey) = {
            let res = self.res.lock();
            let res = res
                .as_ref()
                .ok_or_else(|| Error::disconnected("stream has no resources"))?;
            (res.device.clone(), res.qp, res.mr.lkey)
        };

        let length = payload.len() as u32;
        let buf = DmaBuffer::for_send(payload);
        let dma_addr = device.dma_map(&buf, DmaDirection::ToDevice);
        let sge = SgEntry {
            addr: dma_addr,
            length,
            lkey,
        };
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);

        self.pending_tx
            .lock()
            .insert(wr_id, TxPending { _buf: buf, dma_addr });
        device.dma_sync_for_device(dma_addr);
        self.post_send_count.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = device.post_send(
            qp,
            SendRequest {
                wr_id,
                sge,
                signaled: true,
            },
        ) {
            self.post_send_count.fetch_sub(1, Ordering::AcqRel);
            if let Some(pending) = self.pending_tx.lock().remove(&wr_id) {
                device.dma_unmap(pending.dma_addr);
            }
            warn!(stream = self.name(), error = %e, "post_send failed");
            return Err(e);
        }
        trace!(stream = self.name(), wr_id, length, "posted tx desc");
        Ok(())
    }

    // ---- completion pumps (C4) ----------------------------------------

    /// Harvest up to `max_elements` receive completions into the ready
    /// queue. Returns the number of completions seen (of any opcode).
    fn drain_rx_cq(&self, max_elements: usize) -> usize {
        let mut completed = 0;
        for _ in 0..max_elements {
            let (device, recv_cq) = {
                let res = self.res.lock();
                match res.as_ref() {
                    Some(res) => (res.device.clone(), res.recv_cq),
                    None => return completed,
                }
            };
            let Some(wc) = device.poll_cq(recv_cq) else {
                break;
            };
            completed += 1;
            self.harvest_rx_completion(&device, wc);
        }
        completed
    }

    fn harvest_rx_completion(&self, device: &Arc<dyn VerbsDevice>, wc: WorkCompletion) {
        if wc.status != WcStatus::Success {
            warn!(stream = self.name(), wr_id = wc.wr_id, status = ?wc.status,
                "receive completion with error");
            if let Some(pending) = self.posted_rx.lock().remove(&wc.wr_id) {
                device.dma_unmap(pending.dma_addr);
                self.post_recv_count.fetch_sub(1, Ordering::AcqRel);
            }
            return;
        }
        match wc.opcode {
            WcOpcode::Recv => {
                let Some(pending) = self.posted_rx.lock().remove(&wc.wr_id) else {
                    warn!(stream = self.name(), wr_id = wc.wr_id, "completion for unknown rx desc");
                    return;
                };
                device.dma_sync_for_cpu(pending.dma_addr);
                self.post_recv_count.fetch_sub(1, Ordering::AcqRel);
                let data = pending.buf.take_received(wc.byte_len as usize);
                device.dma_unmap(pending.dma_addr);
                trace!(stream = self.name(), xfer_len = wc.byte_len, "rx completion");
                self.recv_shared.lock().ready.push_back(RxDesc {
                    data,
                    pos: 0,
                    xfer_len: wc.byte_len as usize,
                });
            }
            other => {
                trace!(stream = self.name(), opcode = ?other, "non-recv completion on rx cq");
            }
        }
    }

    /// RX pump: drain, wake receivers, re-arm, and drain once more to
    /// close the completion-vs-arm race.
    fn rx_cq_event(&self) {
        loop {
            self.drain_rx_cq(usize::MAX);
            self.recv_cv.notify_all();

            let handles = {
                let res = self.res.lock();
                res.as_ref().map(|res| (res.device.clone(), res.recv_cq))
            };
            let Some((device, recv_cq)) = handles else {
                return;
            };
            if device.req_notify_cq(recv_cq).is_err() {
                warn!(stream = self.name(), "req_notify_cq failed on recv cq");
                return;
            }
            if self.drain_rx_cq(usize::MAX) == 0 {
                return;
            }
            self.recv_cv.notify_all();
        }
    }

    /// TX pump: reap send completions (freeing staging buffers and
    /// dropping the posted-send count) and re-arm.
    fn tx_cq_event(&self) {
        loop {
            let mut reaped = 0;
            loop {
                let (device, send_cq) = {
                    let res = self.res.lock();
                    match res.as_ref() {
                        Some(res) => (res.device.clone(), res.send_cq),
                        None => return,
                    }
                };
                let Some(wc) = device.poll_cq(send_cq) else {
                    break;
                };
                reaped += 1;
                if wc.status != WcStatus::Success {
                    warn!(stream = self.name(), wr_id = wc.wr_id, status = ?wc.status,
                        "send completion with error");
                }
                if wc.opcode == WcOpcode::Send {
                    if let Some(pending) = self.pending_tx.lock().remove(&wc.wr_id) {
                        device.dma_unmap(pending.dma_addr);
                        self.post_send_count.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }

            let handles = {
                let res = self.res.lock();
                res.as_ref().map(|res| (res.device.clone(), res.send_cq))
            };
            let Some((device, send_cq)) = handles else {
                return;
            };
            if device.req_notify_cq(send_cq).is_err() {
                warn!(stream = self.name(), "req_notify_cq failed on send cq");
                return;
            }
            if reaped == 0 {
                return;
            }
        }
    }

    // ---- receive path (C6 core) ---------------------------------------

    /// Three-mode receive. `GROW_BUFFER` continues the current landing
    /// buffer without waiting or posting; otherwise bytes come from the
    /// current descriptor, pulling fresh descriptors (waiting up to the
    /// receive timeout) as needed. A read spanning landing buffers is
    /// assembled into a fresh allocation; a read within one buffer is a
    /// zero-copy view.
    fn recv_bytes(&self, size: usize, flags: RecvFlags) -> Result<Bytes> {
        if !self.ok() {
            return Err(Error::disconnected("stream not ok"));
        }

        if flags.contains(RecvFlags::GROW_BUFFER) {
            let mut shared = self.recv_shared.lock();
            let current = shared
                .current
                .as_mut()
                .ok_or_else(|| Error::protocol("grow-buffer receive without current buffer"))?;
            if current.pos + size > current.data.len() {
                return Err(Error::protocol("grow-buffer receive past landing buffer"));
            }
            let out = current.data.slice(current.pos..current.pos + size);
            current.pos += size;
            current.xfer_len = current.xfer_len.saturating_sub(size);
            return Ok(out);
        }

        let mut assembled: Option<BytesMut> = None;
        let mut need = size;
        let mut consumed_descs = 0usize;
        let timeout = *self.recv_timeout.lock();

        let result = {
            let mut shared = self.recv_shared.lock();
            loop {
                if self.intr.load(Ordering::Acquire) {
                    break Err(Error::interrupted("receive interrupted"));
                }
                if self.state() >= StreamState::Disconnected {
                    break Err(Error::disconnected("stream went down"));
                }

                let needs_current = shared.current.as_ref().map_or(true, |c| c.xfer_len == 0);
                if needs_current {
                    match shared.ready.pop_front() {
                        Some(desc) => {
                            trace!(stream = self.name(), xfer_len = desc.xfer_len,
                                "picked up new rx desc");
                            shared.current = Some(desc);
                        }
                        None => {
                            let timed_out = self.recv_cv.wait_for(&mut shared, timeout);
                            if timed_out.timed_out() && shared.ready.is_empty() {
                                trace!(stream = self.name(), "recv timed out");
                                break Err(Error::would_block("receive timed out"));
                            }
                        }
                    }
                    continue;
                }

                let current = shared.current.as_mut().expect("current checked above");
                let take = need.min(current.xfer_len);
                let view = current.data.slice(current.pos..current.pos + take);
                current.pos += take;
                current.xfer_len -= take;
                if current.xfer_len == 0 {
                    consumed_descs += 1;
                }

                if take == size && assembled.is_none() {
                    break Ok(view);
                }
                let buf = assembled.get_or_insert_with(|| BytesMut::with_capacity(size));
                buf.extend_from_slice(&view);
                need -= take;
                if need == 0 {
                    break Ok(assembled.take().expect("assembled just written").freeze());
                }
            }
        };

        // Replenish outside the receive lock, one post per spent
        // descriptor.
        for _ in 0..consumed_descs {
            if let Err(e) = self.create_and_post_rx_desc() {
                debug!(stream = self.name(), error = %e, "rx replenishment failed");
                break;
            }
        }

        result
    }

    fn teardown(&self) {
        self.intr.store(true, Ordering::Release);
        self.state_cv.notify_all();
        self.recv_cv.notify_all();

        let res = self.res.lock().take();
        if let Some(res) = res {
            for (_, pending) in self.posted_rx.lock().drain() {
                res.device.dma_unmap(pending.dma_addr);
            }
            for (_, pending) in self.pending_tx.lock().drain() {
                res.device.dma_unmap(pending.dma_addr);
            }
            res.device.dereg_mr(res.mr);
            res.device.destroy_qp(res.qp);
            res.device.destroy_cq(res.send_cq);
            res.device.destroy_cq(res.recv_cq);
            res.device.dealloc_pd(res.pd);
        }
        if let Some(id) = self.cm_id.lock().take() {
            id.destroy();
        }
        if let Some(id) = self.child_cm_id.lock().take() {
            id.destroy();
        }
        let mut shared = self.recv_shared.lock();
        shared.ready.clear();
        shared.current = None;
        self.set_state(StreamState::Disconnected);
    }
}

impl CmEventHandler for RdmaStream {
    fn on_event(&self, id: &Arc<dyn CmId>, event: CmEvent, status: i32) {
        trace!(stream = self.name(), event = ?event, status, "cm event");
        match event {
            CmEvent::AddrResolved => {
                self.set_state(StreamState::AddrResolved);
                if let Err(e) = id.resolve_route(self.resolve_timeout_ms) {
                    warn!(stream = self.name(), error = %e, "resolve_route failed");
                    self.set_state(StreamState::Error);
                }
            }
            CmEvent::RouteResolved => {
                self.set_state(StreamState::RouteResolved);
            }
            CmEvent::ConnectRequest => {
                *self.child_cm_id.lock() = Some(id.clone());
                self.set_state(StreamState::ConnectRequest);
            }
            CmEvent::Established => {
                self.set_state(StreamState::Connected);
            }
            CmEvent::AddrError
            | CmEvent::RouteError
            | CmEvent::ConnectError
            | CmEvent::Unreachable
            | CmEvent::Rejected => {
                warn!(stream = self.name(), event = ?event, status, "cm error event");
                self.set_state(StreamState::Error);
            }
            CmEvent::Disconnected => {
                self.set_state(StreamState::Disconnected);
                self.recv_cv.notify_all();
            }
            CmEvent::DeviceRemoval => {
                warn!(stream = self.name(), "rdma device removal");
            }
        }
    }
}

/// Two-stream RDMA transport.
pub struct RdmaTransport {
    streams: [Arc<RdmaStream>; 2],
    cm: Arc<dyn ConnectionManager>,
    endpoints: PeerEndpoints,
    role: ConnectRole,
    max_tx: usize,
    page_size: usize,
    destroyed: AtomicBool,
}

impl RdmaTransport {
    /// Create a transport bound to a connection manager and peer
    /// endpoints; no traffic until [`Transport::connect`].
    pub fn new(
        cm: Arc<dyn ConnectionManager>,
        config: &TransportConfig,
        endpoints: PeerEndpoints,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: [
                RdmaStream::new(StreamKind::Data, config),
                RdmaStream::new(StreamKind::Control, config),
            ],
            cm,
            endpoints,
            role: config.role,
            max_tx: config.max_tx,
            page_size: config.page_size,
            destroyed: AtomicBool::new(false),
        })
    }

    fn stream(&self, kind: StreamKind) -> &Arc<RdmaStream> {
        &self.streams[kind.index()]
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::disconnected("transport destroyed"));
        }
        Ok(())
    }
}

impl Transport for RdmaTransport {
    fn connect(&self) -> Result<()> {
        self.check_alive()?;
        for (kind, addr) in [
            (StreamKind::Control, self.endpoints.control.clone()),
            (StreamKind::Data, self.endpoints.data.clone()),
        ] {
            let stream = self.stream(kind);
            let result = match self.role {
                ConnectRole::Initiator => stream.connect_stream(&self.cm, &addr),
                ConnectRole::Listener => stream.listen_stream(&self.cm, &addr),
            };
            if let Err(e) = result {
                warn!(stream = stream.name(), error = %e, "stream establishment failed");
                self.free(FreeOp::FreeConnection);
                return Err(e);
            }
        }
        debug!(role = ?self.role, "both streams established");
        Ok(())
    }

    fn send(&self, stream: StreamKind, data: &[u8]) -> Result<usize> {
        self.check_alive()?;
        let s = self.stream(stream);
        if !s.ok() {
            return Err(Error::disconnected("stream not ok"));
        }
        for chunk in data.chunks(self.page_size) {
            s.create_and_post_tx_desc(Bytes::copy_from_slice(chunk))?;
        }
        Ok(data.len())
    }

    fn recv(&self, stream: StreamKind, size: usize, flags: RecvFlags) -> Result<Bytes> {
        self.check_alive()?;
        self.stream(stream).recv_bytes(size, flags)
    }

    fn recv_into(&self, stream: StreamKind, buf: &mut [u8]) -> Result<usize> {
        let bytes = self.recv(stream, buf.len(), RecvFlags::empty())?;
        buf.copy_from_slice(&bytes);
        Ok(buf.len())
    }

    fn send_page(
        &self,
        stream: StreamKind,
        page: &Bytes,
        offset: usize,
        size: usize,
    ) -> Result<usize> {
        self.check_alive()?;
        let s = self.stream(stream);
        if !s.ok() {
            return Err(Error::disconnected("stream not ok"));
        }
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= page.len())
            .ok_or_else(|| Error::protocol("send_page range out of bounds"))?;
        let mut sent = offset;
        while sent < end {
            let chunk_end = (sent + self.page_size).min(end);
            s.create_and_post_tx_desc(page.slice(sent..chunk_end))?;
            sent = chunk_end;
        }
        Ok(size)
    }

    fn recv_pages(&self, size: usize) -> Result<Vec<Bytes>> {
        self.check_alive()?;
        let mut pages = Vec::with_capacity(size.div_ceil(self.page_size));
        let mut remaining = size;
        while remaining > 0 {
            let chunk = remaining.min(self.page_size);
            let page = self
                .stream(StreamKind::Data)
                .recv_bytes(chunk, RecvFlags::empty())?;
            remaining -= page.len();
            pages.push(page);
        }
        Ok(pages)
    }

    fn stats(&self) -> TransportStats {
        let data = self.stream(StreamKind::Data);
        let unread = {
            let shared = data.recv_shared.lock();
            shared.ready.iter().map(|d| d.xfer_len).sum::<usize>()
                + shared.current.as_ref().map_or(0, |d| d.xfer_len)
        };
        TransportStats {
            unread_received: unread,
            unacked_send: 0,
            send_buffer_size: self.max_tx,
            send_buffer_used: data.post_send_count.load(Ordering::Acquire).max(0) as usize,
        }
    }

    fn set_rcvtimeo(&self, stream: StreamKind, timeout: Duration) {
        *self.stream(stream).recv_timeout.lock() = timeout;
    }

    fn get_rcvtimeo(&self, stream: StreamKind) -> Duration {
        *self.stream(stream).recv_timeout.lock()
    }

    fn stream_ok(&self, stream: StreamKind) -> bool {
        !self.destroyed.load(Ordering::Acquire) && self.stream(stream).ok()
    }

    fn hint(&self, _stream: StreamKind, _hint: TransportHint) -> bool {
        // Corking hints have no RDMA equivalent yet; report success so the
        // caller does not treat the transport as broken.
        true
    }

    fn free(&self, op: FreeOp) {
        for stream in &self.streams {
            stream.teardown();
        }
        if op == FreeOp::DestroyTransport {
            self.destroyed.store(true, Ordering::Release);
        }
    }
}
