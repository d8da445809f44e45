//! In-memory verbs device and connection manager.
//!
//! A [`SoftFabric`] connects transports living in the same process the way
//! a real RDMA fabric connects nodes: listeners bind addresses, connectors
//! resolve and connect, queue pairs exchange page-sized messages, and
//! completion queues fire notification callbacks from the delivering
//! thread (the soft-interrupt analog). Used by the test suite and by
//! development deployments without RDMA hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::transport::verbs::{
    CmEvent, CmEventHandler, CmId, ConnParam, ConnectionManager, CqHandle, CqNotify, DmaBuffer,
    DmaDirection, MrAccess, MrHandle, PdHandle, QpHandle, QpInitAttrs, RecvRequest, SendRequest,
    VerbsDevice, WcOpcode, WcStatus, WorkCompletion,
};

/// Process-local fabric: the rendezvous point for soft connections.
pub struct SoftFabric {
    state: Mutex<FabricState>,
    self_weak: Weak<SoftFabric>,
}

struct FabricState {
    listeners: HashMap<String, Arc<SoftCmId>>,
    /// Connectors that arrived before anyone listened on their address.
    pending: HashMap<String, Vec<Arc<SoftCmId>>>,
}

impl SoftFabric {
    /// Create an empty fabric.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|w| Self {
            state: Mutex::new(FabricState {
                listeners: HashMap::new(),
                pending: HashMap::new(),
            }),
            self_weak: w.clone(),
        })
    }

    fn new_id(&self, handler: Arc<dyn CmEventHandler>) -> Arc<SoftCmId> {
        Arc::new_cyclic(|w| SoftCmId {
            fabric: self.self_weak.clone(),
            handler,
            device: SoftDevice::new(),
            peer: Mutex::new(None),
            target: Mutex::new(None),
            bound: Mutex::new(None),
            connected: AtomicBool::new(false),
            self_weak: w.clone(),
        })
    }
}

impl ConnectionManager for SoftFabric {
    fn create_id(&self, handler: Arc<dyn CmEventHandler>) -> Result<Arc<dyn CmId>> {
        Ok(self.new_id(handler) as Arc<dyn CmId>)
    }
}

/// One soft connection-manager id.
pub struct SoftCmId {
    fabric: Weak<SoftFabric>,
    handler: Arc<dyn CmEventHandler>,
    device: Arc<SoftDevice>,
    peer: Mutex<Option<Weak<SoftCmId>>>,
    target: Mutex<Option<String>>,
    bound: Mutex<Option<String>>,
    connected: AtomicBool,
    self_weak: Weak<SoftCmId>,
}

impl SoftCmId {
    fn arc(&self) -> Arc<SoftCmId> {
        self.self_weak.upgrade().expect("id alive while in use")
    }

    fn deliver(&self, event: CmEvent) {
        let id = self.arc() as Arc<dyn CmId>;
        self.handler.on_event(&id, event, 0);
    }

    /// Hand an incoming connector to this listener: spawn the child id
    /// and deliver the connect request on it.
    fn offer(&self, connector: &Arc<SoftCmId>) {
        let fabric = self.fabric.upgrade().expect("fabric alive");
        let child = fabric.new_id(self.handler.clone());
        *child.peer.lock() = Some(Arc::downgrade(connector));
        *connector.peer.lock() = Some(Arc::downgrade(&child));
        trace!("soft cm: offering connect request");
        child.deliver(CmEvent::ConnectRequest);
    }
}

impl CmId for SoftCmId {
    fn resolve_addr(&self, addr: &str, _timeout_ms: u64) -> Result<()> {
        if addr.is_empty() {
            self.deliver(CmEvent::AddrError);
            return Ok(());
        }
        *self.target.lock() = Some(addr.to_string());
        self.deliver(CmEvent::AddrResolved);
        Ok(())
    }

    fn resolve_route(&self, _timeout_ms: u64) -> Result<()> {
        if self.target.lock().is_none() {
            self.deliver(CmEvent::RouteError);
            return Ok(());
        }
        self.deliver(CmEvent::RouteResolved);
        Ok(())
    }

    fn connect(&self, _param: &ConnParam) -> Result<()> {
        let addr = self
            .target
            .lock()
            .clone()
            .ok_or_else(|| Error::protocol("connect without resolved address"))?;
        let fabric = self
            .fabric
            .upgrade()
            .ok_or_else(|| Error::disconnected("fabric gone"))?;

        let listener = {
            let mut state = fabric.state.lock();
            match state.listeners.get(&addr) {
                Some(listener) => Some(listener.clone()),
                None => {
                    // Queue until someone listens; real address resolution
                    // would retry at the IP layer.
                    state.pending.entry(addr).or_default().push(self.arc());
                    None
                }
            }
        };
        if let Some(listener) = listener {
            listener.offer(&self.arc());
        }
        Ok(())
    }

    fn bind_addr(&self, addr: &str) -> Result<()> {
        *self.bound.lock() = Some(addr.to_string());
        Ok(())
    }

    fn listen(&self, _backlog: usize) -> Result<()> {
        let addr = self
            .bound
            .lock()
            .clone()
            .ok_or_else(|| Error::protocol("listen without bound address"))?;
        let fabric = self
            .fabric
            .upgrade()
            .ok_or_else(|| Error::disconnected("fabric gone"))?;

        let waiting = {
            let mut state = fabric.state.lock();
            state.listeners.insert(addr.clone(), self.arc());
            state.pending.remove(&addr).unwrap_or_default()
        };
        for connector in waiting {
            self.offer(&connector);
        }
        Ok(())
    }

    fn accept(&self, _param: &ConnParam) -> Result<()> {
        let peer = self
            .peer
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::disconnected("accept without pending peer"))?;

        self.device.link(&peer.device);
        peer.device.link(&self.device);
        self.connected.store(true, Ordering::Release);
        peer.connected.store(true, Ordering::Release);

        peer.deliver(CmEvent::Established);
        self.deliver(CmEvent::Established);
        Ok(())
    }

    fn device(&self) -> Arc<dyn VerbsDevice> {
        self.device.clone()
    }

    fn destroy(&self) {
        if let Some(fabric) = self.fabric.upgrade() {
            if let Some(addr) = self.bound.lock().clone() {
                let mut state = fabric.state.lock();
                let is_ours = state
                    .listeners
                    .get(&addr)
                    .is_some_and(|current| Arc::ptr_eq(current, &self.arc()));
                if is_ours {
                    state.listeners.remove(&addr);
                }
            }
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
            if let Some(peer) = peer {
                peer.connected.store(false, Ordering::Release);
                peer.device.unlink();
                peer.deliver(CmEvent::Disconnected);
            }
        }
        self.device.unlink();
    }
}

struct SoftCq {
    queue: VecDeque<WorkCompletion>,
    notify: CqNotify,
    armed: bool,
}

struct SoftQp {
    send_cq: u32,
    recv_cq: u32,
    posted_recvs: VecDeque<RecvRequest>,
    /// Payloads that arrived before a receive was posted.
    inbound: VecDeque<Bytes>,
}

struct DevState {
    next_handle: u32,
    next_dma: u64,
    cqs: HashMap<u32, SoftCq>,
    qps: HashMap<u32, SoftQp>,
    dma: HashMap<u64, (Arc<DmaBuffer>, DmaDirection)>,
    peer: Option<Arc<SoftDevice>>,
}

/// One in-memory RDMA device, per cm id.
pub struct SoftDevice {
    state: Mutex<DevState>,
}

impl SoftDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DevState {
                next_handle: 1,
                next_dma: 0x1000,
                cqs: HashMap::new(),
                qps: HashMap::new(),
                dma: HashMap::new(),
                peer: None,
            }),
        })
    }

    fn link(&self, peer: &Arc<SoftDevice>) {
        self.state.lock().peer = Some(peer.clone());
    }

    fn unlink(&self) {
        self.state.lock().peer = None;
    }

    /// Push a completion onto a CQ; returns the notify callback when the
    /// CQ was armed (to be invoked after all locks are dropped).
    fn complete(state: &mut DevState, cq: u32, wc: WorkCompletion) -> Option<CqNotify> {
        let cq = state.cqs.get_mut(&cq)?;
        cq.queue.push_back(wc);
        if cq.armed {
            cq.armed = false;
            Some(cq.notify.clone())
        } else {
            None
        }
    }

    /// Deliver an inbound payload into this device's (single) QP.
    fn deliver(&self, payload: Bytes) {
        let notify = {
            let mut state = self.state.lock();
            let Some((&qp_handle, _)) = state.qps.iter().next() else {
                trace!("soft device: dropping payload, no qp");
                return;
            };
            let (wr, recv_cq) = {
                let qp = state.qps.get_mut(&qp_handle).expect("qp just found");
                (qp.posted_recvs.pop_front(), qp.recv_cq)
            };
            match wr {
                Some(wr) => {
                    let written = state
                        .dma
                        .get(&wr.sge.addr)
                        .map(|(buf, _)| buf.device_write(&payload))
                        .unwrap_or(0);
                    Self::complete(
                        &mut state,
                        recv_cq,
                        WorkCompletion {
                            wr_id: wr.wr_id,
                            status: WcStatus::Success,
                            opcode: WcOpcode::Recv,
                            byte_len: written as u32,
                        },
                    )
                }
                None => {
                    state
                        .qps
                        .get_mut(&qp_handle)
                        .expect("qp just found")
                        .inbound
                        .push_back(payload);
                    None
                }
            }
        };
        if let Some(notify) = notify {
            notify();
        }
    }
}

impl VerbsDevice for SoftDevice {
    fn alloc_pd(&self) -> Result<PdHandle> {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        Ok(PdHandle(handle))
    }

    fn create_cq(&self, _depth: usize, notify: CqNotify) -> Result<CqHandle> {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.cqs.insert(
            handle,
            SoftCq {
                queue: VecDeque::new(),
                notify,
                armed: false,
            },
        );
        Ok(CqHandle(handle))
    }

    fn req_notify_cq(&self, cq: CqHandle) -> Result<()> {
        let mut state = self.state.lock();
        let cq = state
            .cqs
            .get_mut(&cq.0)
            .ok_or_else(|| Error::protocol("unknown cq"))?;
        cq.armed = true;
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle) -> Option<WorkCompletion> {
        self.state.lock().cqs.get_mut(&cq.0)?.queue.pop_front()
    }

    fn create_qp(&self, _pd: PdHandle, attrs: QpInitAttrs) -> Result<QpHandle> {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.qps.insert(
            handle,
            SoftQp {
                send_cq: attrs.send_cq.0,
                recv_cq: attrs.recv_cq.0,
                posted_recvs: VecDeque::new(),
                inbound: VecDeque::new(),
            },
        );
        Ok(QpHandle(handle))
    }

    fn get_dma_mr(&self, _pd: PdHandle, _access: MrAccess) -> Result<MrHandle> {
        Ok(MrHandle { lkey: 0x5aed })
    }

    fn dma_map(&self, buf: &Arc<DmaBuffer>, dir: DmaDirection) -> u64 {
        let mut state = self.state.lock();
        let addr = state.next_dma;
        state.next_dma += 0x1000;
        state.dma.insert(addr, (buf.clone(), dir));
        addr
    }

    fn dma_unmap(&self, addr: u64) {
        self.state.lock().dma.remove(&addr);
    }

    fn dma_sync_for_cpu(&self, _addr: u64) {}

    fn dma_sync_for_device(&self, _addr: u64) {}

    fn post_recv(&self, qp: QpHandle, wr: RecvRequest) -> Result<()> {
        let notify = {
            let mut state = self.state.lock();
            let (buffered, recv_cq) = {
                let qp_entry = state
                    .qps
                    .get_mut(&qp.0)
                    .ok_or_else(|| Error::protocol("unknown qp"))?;
                (qp_entry.inbound.pop_front(), qp_entry.recv_cq)
            };
            match buffered {
                Some(payload) => {
                    let written = state
                        .dma
                        .get(&wr.sge.addr)
                        .map(|(buf, _)| buf.device_write(&payload))
                        .unwrap_or(0);
                    Self::complete(
                        &mut state,
                        recv_cq,
                        WorkCompletion {
                            wr_id: wr.wr_id,
                            status: WcStatus::Success,
                            opcode: WcOpcode::Recv,
                            byte_len: written as u32,
                        },
                    )
                }
                None => {
                    state
                        .qps
                        .get_mut(&qp.0)
                        .expect("qp checked above")
                        .posted_recvs
                        .push_back(wr);
                    None
                }
            }
        };
        if let Some(notify) = notify {
            notify();
        }
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wr: SendRequest) -> Result<()> {
        let (payload, peer, send_notify) = {
            let mut state = self.state.lock();
            if !state.qps.contains_key(&qp.0) {
                return Err(Error::protocol("unknown qp"));
            }
            let payload = state
                .dma
                .get(&wr.sge.addr)
                .map(|(buf, _)| buf.device_read())
                .ok_or_else(|| Error::protocol("send from unmapped buffer"))?;
            let payload = payload.slice(..(wr.sge.length as usize).min(payload.len()));
            let peer = state
                .peer
                .clone()
                .ok_or_else(|| Error::disconnected("qp not connected"))?;

            let send_notify = if wr.signaled {
                let send_cq = state.qps[&qp.0].send_cq;
                Self::complete(
                    &mut state,
                    send_cq,
                    WorkCompletion {
                        wr_id: wr.wr_id,
                        status: WcStatus::Success,
                        opcode: WcOpcode::Send,
                        byte_len: wr.sge.length,
                    },
                )
            } else {
                None
            };
            (payload, peer, send_notify)
        };

        peer.deliver(payload);
        if let Some(notify) = send_notify {
            notify();
        }
        Ok(())
    }

    fn destroy_qp(&self, qp: QpHandle) {
        self.state.lock().qps.remove(&qp.0);
    }

    fn destroy_cq(&self, cq: CqHandle) {
        self.state.lock().cqs.remove(&cq.0);
    }

    fn dealloc_pd(&self, _pd: PdHandle) {}

    fn dereg_mr(&self, _mr: MrHandle) {}
}
