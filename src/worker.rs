//! The worker: one long-running thread per connection that serializes all
//! outbound replication activity.
//!
//! The queue is a plain FIFO behind a counting semaphore, kernel style:
//! the semaphore and the list are updated independently, so the loop
//! tolerates (and warns about) a successful down with an empty list.
//! Callbacks run to completion and are never preempted by another worker
//! callback on the same connection; everything that must also run
//! timer-driven enqueues itself through the timer service, never by
//! direct invocation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::state::{ConnState, DiskState, StateFlags};
use crate::transport::{StreamKind, TransportHint};
use crate::work::WorkItem;

/// Counting semaphore with an interruptible down.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Semaphore {
    /// Create with a count of zero.
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Release one unit.
    pub fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_one();
    }

    /// Try to take one unit without blocking.
    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Take one unit, blocking until available or until `signal` is
    /// raised.
    pub fn down_interruptible(&self, signal: &AtomicBool) -> Result<()> {
        let mut count = self.count.lock();
        loop {
            if signal.load(Ordering::Acquire) {
                return Err(Error::interrupted("semaphore wait interrupted"));
            }
            if *count > 0 {
                *count -= 1;
                return Ok(());
            }
            self.cv.wait(&mut count);
        }
    }

    /// Wake all waiters so they can observe a raised signal.
    pub fn kick(&self) {
        self.cv.notify_all();
    }

    /// Reset the count to zero.
    pub fn reset(&self) {
        *self.count.lock() = 0;
    }
}

/// The connection's work queue: FIFO list plus semaphore.
pub struct WorkQueue {
    list: Mutex<VecDeque<WorkItem>>,
    /// Wakes the worker; counted independently from the list
    pub sem: Semaphore,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
            sem: Semaphore::new(),
        }
    }

    /// Enqueue a work item.
    pub fn queue(&self, item: WorkItem) {
        self.list.lock().push_back(item);
        self.sem.up();
    }

    /// Queue depth.
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// True when no items are pending.
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    fn pop(&self) -> Option<WorkItem> {
        self.list.lock().pop_front()
    }

    fn splice_all(&self) -> VecDeque<WorkItem> {
        std::mem::take(&mut *self.list.lock())
    }
}

/// Lifecycle state of the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Normal operation
    Running,
    /// Shut down after draining
    Exiting,
    /// Restart requested
    Restarting,
}

/// Shared control block for a worker thread.
pub struct WorkerControl {
    state: Mutex<ThreadState>,
    signal: AtomicBool,
}

impl WorkerControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ThreadState::Running),
            signal: AtomicBool::new(false),
        })
    }

    /// Current thread state.
    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    /// Change the thread state (does not wake the worker by itself).
    pub fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    /// Raise the signal flag.
    pub fn raise_signal(&self) {
        self.signal.store(true, Ordering::Release);
    }

    /// Consume a pending signal. Returns whether one was pending.
    pub fn flush_signals(&self) -> bool {
        self.signal.swap(false, Ordering::AcqRel)
    }

    fn signal_flag(&self) -> &AtomicBool {
        &self.signal
    }
}

/// Handle to a spawned worker thread.
pub struct WorkerHandle {
    control: Arc<WorkerControl>,
    queue: Arc<WorkQueue>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// The worker's control block.
    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    /// Ask the worker to exit, wake it, and join it. The queue is drained
    /// with `cancel` set before the thread ends.
    pub fn stop(mut self) {
        self.control.set_state(ThreadState::Exiting);
        self.control.raise_signal();
        self.queue.sem.kick();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the worker thread for a connection.
pub fn spawn_worker(conn: Arc<Connection>) -> WorkerHandle {
    let control = WorkerControl::new();
    let queue = conn.queue.clone();
    let thread_control = control.clone();
    let handle = thread::Builder::new()
        .name("mirror-worker".to_string())
        .spawn(move || worker_loop(conn, thread_control))
        .expect("failed to spawn worker thread");
    WorkerHandle {
        control,
        queue,
        handle: Some(handle),
    }
}

/// The worker loop. Public so embedders can run it on their own thread.
pub fn worker_loop(conn: Arc<Connection>, control: Arc<WorkerControl>) {
    let queue = conn.queue.clone();

    while control.state() == ThreadState::Running {
        if !queue.sem.try_down() {
            // Idle: flush batched sends while we sleep, batch again once
            // there is work.
            {
                let _guard = conn.data_mutex.lock();
                conn.transport.hint(StreamKind::Data, TransportHint::Uncork);
            }
            let interrupted = queue
                .sem
                .down_interruptible(control.signal_flag())
                .is_err();
            {
                let _guard = conn.data_mutex.lock();
                conn.transport.hint(StreamKind::Data, TransportHint::Cork);
            }

            if interrupted {
                control.flush_signals();
                if control.state() == ThreadState::Running {
                    warn!("worker got an unexpected signal");
                    continue;
                }
                break;
            }
        }

        if control.state() != ThreadState::Running {
            // Downed the semaphore but will not consume the entry; the
            // drain below takes care of it.
            break;
        }

        let Some(item) = queue.pop() else {
            warn!("work list unexpectedly empty");
            continue;
        };

        let cancel = conn.cstate() < ConnState::WfReportParams;
        EngineMetrics::inc(&conn.metrics.items_executed);
        if cancel {
            EngineMetrics::inc(&conn.metrics.items_cancelled);
        }
        if item.run(&conn, cancel).is_err() {
            EngineMetrics::inc(&conn.metrics.callback_failures);
            if conn.cstate() >= ConnState::WfReportParams {
                EngineMetrics::inc(&conn.metrics.escalations);
                conn.request_state(ConnState::NetworkFailure, StateFlags::HARD);
            }
        }
    }

    // Shutdown drain: splice pending work out and cancel it, repeating
    // until the queue is stably empty.
    loop {
        let drained = queue.splice_all();
        if drained.is_empty() {
            break;
        }
        debug!(count = drained.len(), "draining work queue on shutdown");
        for item in drained {
            EngineMetrics::inc(&conn.metrics.items_executed);
            EngineMetrics::inc(&conn.metrics.items_cancelled);
            let _ = item.run(&conn, true);
        }
    }
    queue.sem.reset();

    for device in conn.devices() {
        let state = device.state();
        if state.disk != DiskState::Diskless || state.conn != ConnState::StandAlone {
            warn!(
                minor = device.minor,
                disk = ?state.disk,
                conn = ?state.conn,
                "device not in final state at worker exit"
            );
        }
        device.cleanup();
    }
    debug!("worker exited");
}

/// One-shot completion event for barrier-style waits.
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    /// Create an unsignalled completion.
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Signal the completion.
    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    /// Wait until signalled or until `timeout` elapses. Returns whether
    /// the completion fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.cv.wait_for(&mut done, timeout);
        }
        *done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Registry;
    use crate::requests::{HeapAllocator, NullRequestStateMachine};
    use crate::state::NullHelper;
    use crate::timer::TimerService;
    use crate::transport::mock::RecordingTransport;
    use parking_lot::Mutex as PlMutex;

    fn test_connection() -> Arc<Connection> {
        crate::logging::init_for_tests();
        Connection::new(
            Arc::new(Registry::new()),
            Arc::new(RecordingTransport::new()),
            TimerService::new(),
            Arc::new(NullRequestStateMachine),
            Arc::new(NullHelper),
            Arc::new(HeapAllocator),
        )
    }

    fn record_item(log: &Arc<PlMutex<Vec<(char, bool)>>>, tag: char) -> WorkItem {
        let log = log.clone();
        WorkItem::Callback {
            f: Box::new(move |cancel| {
                log.lock().push((tag, cancel));
                Ok(())
            }),
        }
    }

    #[test]
    fn test_semaphore_try_down_and_up() {
        let sem = Semaphore::new();
        assert!(!sem.try_down());
        sem.up();
        sem.up();
        assert!(sem.try_down());
        assert!(sem.try_down());
        assert!(!sem.try_down());
    }

    #[test]
    fn test_semaphore_interruptible() {
        let sem = Arc::new(Semaphore::new());
        let signal = Arc::new(AtomicBool::new(false));
        let sem2 = sem.clone();
        let signal2 = signal.clone();
        let waiter = thread::spawn(move || sem2.down_interruptible(&signal2));
        thread::sleep(Duration::from_millis(20));
        signal.store(true, Ordering::Release);
        sem.kick();
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn test_fifo_execution_order() {
        let conn = test_connection();
        conn.request_state(ConnState::Connected, StateFlags::HARD);
        let log = Arc::new(PlMutex::new(Vec::new()));

        let worker = spawn_worker(conn.clone());
        for tag in ['a', 'b', 'c', 'd'] {
            conn.queue.queue(record_item(&log, tag));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while log.lock().len() < 4 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        worker.stop();

        let entries = log.lock();
        let order: Vec<char> = entries.iter().map(|(t, _)| *t).collect();
        assert_eq!(order, vec!['a', 'b', 'c', 'd']);
        // connected: nothing was cancelled
        assert!(entries.iter().all(|(_, cancel)| !cancel));
    }

    #[test]
    fn test_shutdown_drain_cancels_in_order() {
        let conn = test_connection();
        let log = Arc::new(PlMutex::new(Vec::new()));

        // X, Y, Z queued while no worker is running; then the worker is
        // told to exit before it ever dequeues.
        for tag in ['x', 'y', 'z'] {
            conn.queue.queue(record_item(&log, tag));
        }

        // stop() races the dequeue: either way every item must run
        // exactly once, in order.
        let worker = spawn_worker(conn.clone());
        worker.stop();

        let entries = log.lock();
        let order: Vec<char> = entries.iter().map(|(t, _)| *t).collect();
        assert_eq!(order, vec!['x', 'y', 'z']);
    }

    #[test]
    fn test_drain_runs_every_item_with_cancel() {
        let conn = test_connection();
        let log = Arc::new(PlMutex::new(Vec::new()));
        for tag in ['x', 'y', 'z'] {
            conn.queue.queue(record_item(&log, tag));
        }

        // Run the loop body directly with the thread already exiting:
        // only the drain executes.
        let control = WorkerControl::new();
        control.set_state(ThreadState::Exiting);
        worker_loop(conn.clone(), control);

        let entries = log.lock();
        assert_eq!(entries.len(), 3);
        let order: Vec<char> = entries.iter().map(|(t, _)| *t).collect();
        assert_eq!(order, vec!['x', 'y', 'z']);
        assert!(entries.iter().all(|(_, cancel)| *cancel));
        assert!(conn.queue.is_empty());
    }

    #[test]
    fn test_callback_failure_escalates_after_report_params() {
        let conn = test_connection();
        conn.request_state(ConnState::Connected, StateFlags::HARD);

        let worker = spawn_worker(conn.clone());
        conn.queue.queue(WorkItem::Callback {
            f: Box::new(|_| Err(crate::error::Error::disconnected("boom"))),
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while conn.cstate() != ConnState::NetworkFailure
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        worker.stop();
        assert_eq!(conn.cstate(), ConnState::NetworkFailure);
    }

    #[test]
    fn test_callback_failure_before_report_params_is_tolerated() {
        let conn = test_connection();
        // cstate stays StandAlone: callbacks run cancelled, failures do
        // not escalate
        let worker = spawn_worker(conn.clone());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        conn.queue.queue(WorkItem::Callback {
            f: Box::new(move |cancel| {
                ran2.store(true, Ordering::Release);
                assert!(cancel);
                Err(crate::error::Error::disconnected("ignored"))
            }),
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !ran.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        worker.stop();
        assert!(ran.load(Ordering::Acquire));
        assert_ne!(conn.cstate(), ConnState::NetworkFailure);
    }

    #[test]
    fn test_spurious_semaphore_up_is_survived() {
        let conn = test_connection();
        conn.request_state(ConnState::Connected, StateFlags::HARD);
        let worker = spawn_worker(conn.clone());

        // An up() without a list entry: the worker warns and continues.
        conn.queue.sem.up();

        let log = Arc::new(PlMutex::new(Vec::new()));
        conn.queue.queue(record_item(&log, 'a'));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while log.lock().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        worker.stop();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_barrier_done_signals_waiter() {
        let conn = test_connection();
        conn.request_state(ConnState::Connected, StateFlags::HARD);
        let worker = spawn_worker(conn.clone());

        let done = Arc::new(Completion::new());
        conn.queue.queue(WorkItem::BarrierDone { done: done.clone() });
        assert!(done.wait_timeout(Duration::from_secs(2)));
        worker.stop();
    }

    #[test]
    fn test_worker_corks_around_idle() {
        crate::logging::init_for_tests();
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(
            Arc::new(Registry::new()),
            transport.clone(),
            TimerService::new(),
            Arc::new(NullRequestStateMachine),
            Arc::new(NullHelper),
            Arc::new(HeapAllocator),
        );
        conn.request_state(ConnState::Connected, StateFlags::HARD);
        let worker = spawn_worker(conn.clone());
        thread::sleep(Duration::from_millis(30));
        conn.queue.queue(WorkItem::Callback {
            f: Box::new(|_| Ok(())),
        });
        thread::sleep(Duration::from_millis(30));
        worker.stop();

        let hints = transport.hints();
        // idle entry uncorks, wakeup corks again
        assert!(hints.contains(&(crate::transport::StreamKind::Data, TransportHint::Uncork)));
        assert!(hints.contains(&(crate::transport::StreamKind::Data, TransportHint::Cork)));
    }
}
