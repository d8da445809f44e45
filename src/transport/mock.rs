//! Recording transport for unit tests.
//!
//! Captures everything the engine sends, serves scripted inbound bytes,
//! and lets tests dial the reported send-buffer usage to exercise
//! back-pressure paths. No I/O, no blocking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocol::{self, Frame};
use crate::transport::{
    FreeOp, RecvFlags, StreamKind, Transport, TransportHint, TransportStats,
};

/// Transport that records sends and replays scripted receives.
pub struct RecordingTransport {
    sent: Mutex<[BytesMut; 2]>,
    inbound: Mutex<[VecDeque<Bytes>; 2]>,
    stats: Mutex<TransportStats>,
    ok: [AtomicBool; 2],
    fail_sends: AtomicBool,
    timeouts: Mutex<[Duration; 2]>,
    hints: Mutex<Vec<(StreamKind, TransportHint)>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    /// Create a healthy transport with empty buffers.
    pub fn new() -> Self {
        Self {
            sent: Mutex::new([BytesMut::new(), BytesMut::new()]),
            inbound: Mutex::new([VecDeque::new(), VecDeque::new()]),
            stats: Mutex::new(TransportStats {
                unread_received: 0,
                unacked_send: 0,
                send_buffer_size: 20,
                send_buffer_used: 0,
            }),
            ok: [AtomicBool::new(true), AtomicBool::new(true)],
            fail_sends: AtomicBool::new(false),
            timeouts: Mutex::new([Duration::from_secs(10), Duration::from_secs(10)]),
            hints: Mutex::new(Vec::new()),
        }
    }

    /// All bytes sent on `stream`, concatenated.
    pub fn sent_bytes(&self, stream: StreamKind) -> Bytes {
        Bytes::copy_from_slice(&self.sent.lock()[stream.index()])
    }

    /// Decode the sent byte stream into protocol frames.
    pub fn sent_frames(&self, stream: StreamKind) -> Vec<Frame> {
        let mut buf = self.sent_bytes(stream);
        let mut frames = Vec::new();
        while !buf.is_empty() {
            match protocol::decode(&mut buf) {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }
        frames
    }

    /// Drop everything recorded so far.
    pub fn clear_sent(&self) {
        for buf in self.sent.lock().iter_mut() {
            buf.clear();
        }
    }

    /// Queue bytes the engine will receive on `stream`.
    pub fn push_inbound(&self, stream: StreamKind, data: Bytes) {
        self.inbound.lock()[stream.index()].push_back(data);
    }

    /// Script the reported send-buffer usage.
    pub fn set_send_buffer(&self, size: usize, used: usize) {
        let mut stats = self.stats.lock();
        stats.send_buffer_size = size;
        stats.send_buffer_used = used;
    }

    /// Script stream health.
    pub fn set_stream_ok(&self, stream: StreamKind, ok: bool) {
        self.ok[stream.index()].store(ok, Ordering::Release);
    }

    /// Make subsequent sends fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    /// Hints the engine applied, in order.
    pub fn hints(&self) -> Vec<(StreamKind, TransportHint)> {
        self.hints.lock().clone()
    }

    fn check(&self, stream: StreamKind) -> Result<()> {
        if !self.ok[stream.index()].load(Ordering::Acquire) {
            return Err(Error::disconnected("stream scripted down"));
        }
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(Error::disconnected("send scripted to fail"));
        }
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn send(&self, stream: StreamKind, data: &[u8]) -> Result<usize> {
        self.check(stream)?;
        self.sent.lock()[stream.index()].extend_from_slice(data);
        Ok(data.len())
    }

    fn recv(&self, stream: StreamKind, size: usize, _flags: RecvFlags) -> Result<Bytes> {
        if !self.ok[stream.index()].load(Ordering::Acquire) {
            return Err(Error::disconnected("stream scripted down"));
        }
        let mut inbound = self.inbound.lock();
        let queue = &mut inbound[stream.index()];
        match queue.pop_front() {
            Some(mut data) => {
                if data.len() > size {
                    let rest = data.split_off(size);
                    queue.push_front(rest);
                }
                Ok(data)
            }
            None => Err(Error::would_block("no scripted input")),
        }
    }

    fn recv_into(&self, stream: StreamKind, buf: &mut [u8]) -> Result<usize> {
        let data = self.recv(stream, buf.len(), RecvFlags::empty())?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn send_page(
        &self,
        stream: StreamKind,
        page: &Bytes,
        offset: usize,
        size: usize,
    ) -> Result<usize> {
        self.check(stream)?;
        self.sent.lock()[stream.index()].extend_from_slice(&page[offset..offset + size]);
        Ok(size)
    }

    fn recv_pages(&self, size: usize) -> Result<Vec<Bytes>> {
        let page = self.recv(StreamKind::Data, size, RecvFlags::empty())?;
        Ok(vec![page])
    }

    fn stats(&self) -> TransportStats {
        *self.stats.lock()
    }

    fn set_rcvtimeo(&self, stream: StreamKind, timeout: Duration) {
        self.timeouts.lock()[stream.index()] = timeout;
    }

    fn get_rcvtimeo(&self, stream: StreamKind) -> Duration {
        self.timeouts.lock()[stream.index()]
    }

    fn stream_ok(&self, stream: StreamKind) -> bool {
        self.ok[stream.index()].load(Ordering::Acquire)
    }

    fn hint(&self, stream: StreamKind, hint: TransportHint) -> bool {
        self.hints.lock().push((stream, hint));
        true
    }

    fn free(&self, _op: FreeOp) {
        for ok in &self.ok {
            ok.store(false, Ordering::Release);
        }
    }
}
