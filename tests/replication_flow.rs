//! End-to-end replication flow over the in-memory fabric: a worker on
//! the primary side pushes mirrored writes, barriers and resync requests
//! through a real transport pair, and the test plays the peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

use aurora_mirror::activity_log::{NullActivityLog, NullResyncLru};
use aurora_mirror::bitmap::MemoryBitmap;
use aurora_mirror::config::{Config, ConnectRole};
use aurora_mirror::connection::Connection;
use aurora_mirror::device::{Device, NullLowerDevice, Registry};
use aurora_mirror::protocol::{self, Frame, MessageType, HEADER_SIZE};
use aurora_mirror::requests::{
    HeapAllocator, MasterBioCompletion, ReqEvent, Request, RequestStateMachine,
};
use aurora_mirror::state::{ConnState, DeviceState, DiskState, NullHelper, StateFlags};
use aurora_mirror::timer::TimerService;
use aurora_mirror::transport::rdma::RdmaTransport;
use aurora_mirror::transport::softdev::SoftFabric;
use aurora_mirror::transport::{PeerEndpoints, RecvFlags, StreamKind, Transport};
use aurora_mirror::work::WorkItem;
use aurora_mirror::worker::spawn_worker;

fn endpoints() -> PeerEndpoints {
    PeerEndpoints {
        data: "primary:7789-data".to_string(),
        control: "primary:7789-ctrl".to_string(),
    }
}

fn transport_pair() -> (Arc<RdmaTransport>, Arc<RdmaTransport>) {
    let fabric = SoftFabric::new();
    let mut server_config = Config::default().transport;
    server_config.role = ConnectRole::Listener;
    let client_config = Config::default().transport;

    let server = RdmaTransport::new(fabric.clone(), &server_config, endpoints());
    let client = RdmaTransport::new(fabric, &client_config, endpoints());

    let server2 = server.clone();
    let listener = std::thread::spawn(move || server2.connect());
    client.connect().expect("client connect");
    listener.join().unwrap().expect("server connect");
    (server, client)
}

/// Read one complete frame off a stream, reassembling header and
/// payload across landing buffers.
fn read_frame(t: &Arc<RdmaTransport>, stream: StreamKind) -> Frame {
    let header = t.recv(stream, HEADER_SIZE, RecvFlags::empty()).unwrap();
    let mut peek = header.clone();
    let _magic = peek.get_u32();
    let _cmd = peek.get_u16();
    let length = peek.get_u32() as usize;

    let mut whole = BytesMut::with_capacity(HEADER_SIZE + length);
    whole.extend_from_slice(&header);
    if length > 0 {
        let payload = t.recv(stream, length, RecvFlags::empty()).unwrap();
        whole.extend_from_slice(&payload);
    }
    protocol::decode(&mut whole.freeze()).unwrap()
}

#[derive(Default)]
struct RecordingStateMachine {
    events: Mutex<Vec<ReqEvent>>,
}

impl RequestStateMachine for RecordingStateMachine {
    fn apply(&self, _req: &Arc<Request>, what: ReqEvent) -> Option<MasterBioCompletion> {
        self.events.lock().push(what);
        None
    }
}

struct Primary {
    conn: Arc<Connection>,
    device: Arc<Device>,
    bitmap: Arc<MemoryBitmap>,
    req_sm: Arc<RecordingStateMachine>,
}

fn primary_with(transport: Arc<RdmaTransport>) -> Primary {
    let registry = Arc::new(Registry::new());
    let req_sm = Arc::new(RecordingStateMachine::default());
    let conn = Connection::new(
        registry.clone(),
        transport,
        TimerService::new(),
        req_sm.clone(),
        Arc::new(NullHelper),
        Arc::new(HeapAllocator),
    );
    conn.request_state(ConnState::Connected, StateFlags::HARD);

    let capacity = 1 << 20;
    let bitmap = Arc::new(MemoryBitmap::new(capacity));
    let mut sync = Config::default().sync;
    sync.c_plan_ahead = 0;
    sync.resync_rate = 160; // 4 blocks per tick
    let device = Device::new(
        0,
        capacity,
        sync,
        bitmap.clone(),
        Arc::new(NullActivityLog),
        Arc::new(NullResyncLru),
        Arc::new(NullLowerDevice),
    );
    conn.add_device(device.clone());
    let ns = DeviceState {
        conn: ConnState::Connected,
        disk: DiskState::UpToDate,
        pdsk: DiskState::UpToDate,
        aftr_isp: false,
        peer_isp: false,
        user_isp: false,
    };
    registry.set_state(&device, ns, StateFlags::HARD);
    Primary {
        conn,
        device,
        bitmap,
        req_sm,
    }
}

#[test]
fn test_mirrored_write_reaches_peer() {
    let (peer, transport) = transport_pair();
    let primary = primary_with(transport);
    let worker = spawn_worker(primary.conn.clone());

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 255) as u8).collect();
    let req = Arc::new(Request {
        minor: 0,
        sector: 2048,
        size: 4096,
        write: true,
        in_act_log: true,
        payload: Some(Bytes::from(payload.clone())),
    });
    primary.conn.queue.queue(WorkItem::SendDataBlock {
        device: primary.device.clone(),
        req: req.clone(),
    });

    let frame = read_frame(&peer, StreamKind::Data);
    assert_eq!(frame.msg, MessageType::Data);
    let block = frame.block.unwrap();
    assert_eq!(block.sector, 2048);
    assert_eq!(block.size, 4096);
    assert_eq!(&frame.payload[..], &payload[..]);

    worker.stop();
    let events = primary.req_sm.events.lock();
    assert_eq!(events.as_slice(), &[ReqEvent::HandedOverToNetwork]);
    assert_eq!(primary.device.send_cnt.load(Ordering::Relaxed), 8);
}

#[test]
fn test_barrier_and_write_hint_ordering() {
    let (peer, transport) = transport_pair();
    let primary = primary_with(transport);
    let worker = spawn_worker(primary.conn.clone());

    let epoch_valid = Arc::new(AtomicBool::new(true));
    primary.conn.queue.queue(WorkItem::SendBarrier {
        barrier_nr: 17,
        epoch_valid: epoch_valid.clone(),
    });
    primary.conn.queue.queue(WorkItem::SendWriteHint {
        device: primary.device.clone(),
    });

    let frame = read_frame(&peer, StreamKind::Data);
    assert_eq!(frame.msg, MessageType::Barrier);
    assert_eq!(frame.barrier_nr, Some(17));

    let frame = read_frame(&peer, StreamKind::Data);
    assert_eq!(frame.msg, MessageType::UnplugRemote);

    worker.stop();
}

#[test]
fn test_cleared_epoch_suppresses_barrier() {
    let (peer, transport) = transport_pair();
    let primary = primary_with(transport);
    let worker = spawn_worker(primary.conn.clone());

    let cleared = Arc::new(AtomicBool::new(false));
    primary.conn.queue.queue(WorkItem::SendBarrier {
        barrier_nr: 18,
        epoch_valid: cleared,
    });
    primary.conn.queue.queue(WorkItem::SendWriteHint {
        device: primary.device.clone(),
    });

    // Only the write hint arrives; the stale barrier was dropped.
    let frame = read_frame(&peer, StreamKind::Data);
    assert_eq!(frame.msg, MessageType::UnplugRemote);

    worker.stop();
}

#[test]
fn test_resync_tick_emits_coalesced_request_over_the_wire() {
    let (peer, transport) = transport_pair();
    let primary = primary_with(transport);

    primary.bitmap.set_bits(100..104);
    primary.device.rs_total.store(4, Ordering::Release);
    let ns = DeviceState {
        conn: ConnState::SyncTarget,
        disk: DiskState::Inconsistent,
        pdsk: DiskState::UpToDate,
        aftr_isp: false,
        peer_isp: false,
        user_isp: false,
    };
    primary
        .conn
        .registry
        .set_state(&primary.device, ns, StateFlags::HARD);

    let worker = spawn_worker(primary.conn.clone());
    primary.conn.queue.queue(WorkItem::ResyncTick {
        device: primary.device.clone(),
    });

    let frame = read_frame(&peer, StreamKind::Data);
    assert_eq!(frame.msg, MessageType::RsDataRequest);
    let block = frame.block.unwrap();
    assert_eq!(block.sector, 800);
    assert_eq!(block.size, 16384);
    assert_eq!(
        primary.device.bm_resync_fo.load(Ordering::Acquire),
        104
    );

    worker.stop();
}

#[test]
fn test_shutdown_drain_cancels_queued_sends() {
    let (peer, transport) = transport_pair();
    let primary = primary_with(transport);

    // No worker is running; queue a write and shut down immediately.
    let req = Arc::new(Request {
        minor: 0,
        sector: 0,
        size: 4096,
        write: true,
        in_act_log: false,
        payload: Some(Bytes::from(vec![0u8; 4096])),
    });
    primary.conn.queue.queue(WorkItem::SendDataBlock {
        device: primary.device.clone(),
        req,
    });
    // Drop to standalone so the drain cancels instead of sending.
    primary
        .conn
        .request_state(ConnState::StandAlone, StateFlags::HARD);

    let worker = spawn_worker(primary.conn.clone());
    worker.stop();

    let events = primary.req_sm.events.lock();
    assert_eq!(events.as_slice(), &[ReqEvent::SendCanceled]);

    // Nothing went out.
    peer.set_rcvtimeo(StreamKind::Data, Duration::from_millis(30));
    assert!(peer
        .recv(StreamKind::Data, 1, RecvFlags::empty())
        .is_err());
}
