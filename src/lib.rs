//! # Aurora Mirror: Block-Level Replication Engine
//!
//! Aurora Mirror keeps a remote peer byte-identical to a local block
//! device: every write is mirrored over the replication link, and a
//! bitmap-driven background resync brings a formerly-disconnected peer
//! back up to date while application I/O keeps flowing.
//!
//! ## Architecture
//!
//! ```text
//! Aurora Mirror Engine
//! ├── Worker Subsystem
//! │   ├── Work queue (FIFO + semaphore, single worker thread)
//! │   ├── Work-item catalog (sends, replies, barriers, lifecycle)
//! │   ├── Resync scheduler (bitmap sweep + coalescing + csum dedup)
//! │   ├── Resync controller (plan-ahead rate feedback loop)
//! │   ├── Dependency graph (resync-after pause/resume cascade)
//! │   └── Endio dispatch (lower-device completions → work items)
//! └── RDMA Transport
//!     ├── Two streams (DATA + CONTROL) per connection
//!     ├── RX descriptor ring + TX staging path
//!     ├── Completion pumps (drain, wake, re-arm)
//!     └── Stream state machine (resolve/connect, bind/listen/accept)
//! ```
//!
//! The worker is the serialization point: all outbound replication
//! activity for one connection runs on its single thread, callbacks run
//! to completion, and cancellation is a flag handed to every callback
//! rather than an exception. Completions from the lower block device and
//! from the RDMA completion queues arrive on foreign threads and only
//! touch queues, atomics, and condition variables.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use aurora_mirror::activity_log::{NullActivityLog, NullResyncLru};
//! use aurora_mirror::bitmap::MemoryBitmap;
//! use aurora_mirror::config::Config;
//! use aurora_mirror::connection::Connection;
//! use aurora_mirror::device::{Device, NullLowerDevice, Registry};
//! use aurora_mirror::requests::{HeapAllocator, NullRequestStateMachine};
//! use aurora_mirror::state::NullHelper;
//! use aurora_mirror::timer::TimerService;
//! use aurora_mirror::transport::rdma::RdmaTransport;
//! use aurora_mirror::transport::softdev::SoftFabric;
//! use aurora_mirror::transport::{PeerEndpoints, Transport};
//! use aurora_mirror::worker::spawn_worker;
//!
//! let config = Config::default();
//! let fabric = SoftFabric::new();
//! let transport = RdmaTransport::new(
//!     fabric,
//!     &config.transport,
//!     PeerEndpoints {
//!         data: "peer:7789-data".into(),
//!         control: "peer:7789-ctrl".into(),
//!     },
//! );
//! transport.connect().unwrap();
//!
//! let registry = Arc::new(Registry::new());
//! let conn = Connection::new(
//!     registry,
//!     transport,
//!     TimerService::new(),
//!     Arc::new(NullRequestStateMachine),
//!     Arc::new(NullHelper),
//!     Arc::new(HeapAllocator),
//! );
//! let capacity = 1 << 21; // sectors
//! conn.add_device(Device::new(
//!     0,
//!     capacity,
//!     config.sync.clone(),
//!     Arc::new(MemoryBitmap::new(capacity)),
//!     Arc::new(NullActivityLog),
//!     Arc::new(NullResyncLru),
//!     Arc::new(NullLowerDevice),
//! ));
//! let worker = spawn_worker(conn);
//! // ... replicate ...
//! worker.stop();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod activity_log;
pub mod bitmap;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod controller;
pub mod dependencies;
pub mod device;
pub mod endio;
pub mod error;
pub mod fifo;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod requests;
pub mod resync;
pub mod state;
pub mod timer;
pub mod transport;
pub mod work;
pub mod worker;

// Re-export main types
pub use config::Config;
pub use connection::Connection;
pub use device::{Device, Registry};
pub use error::{Error, Result};
pub use transport::Transport;
pub use work::WorkItem;
pub use worker::{spawn_worker, WorkerHandle};
