//! Timer service for deferred work.
//!
//! Timer-driven work (the resync tick, deferred start-of-resync) is always
//! delivered by enqueueing a work item, never by invoking a callback
//! directly from arbitrary context. Re-arming a key replaces the pending
//! deadline, matching classic kernel-timer semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Which per-device timer a key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Resync tick
    Resync,
    /// Deferred start-of-resync
    StartResync,
}

/// Timer identity: one slot per device and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    /// Device minor
    pub minor: u32,
    /// Timer slot
    pub kind: TimerKind,
}

type TimerFn = Box<dyn FnOnce() + Send>;

struct TimerInner {
    entries: Mutex<HashMap<TimerKey, (Instant, TimerFn)>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

/// Deadline-driven dispatcher with one background thread.
pub struct TimerService {
    inner: Arc<TimerInner>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerService {
    /// Start the timer thread.
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(TimerInner {
            entries: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let thread_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("mirror-timer".to_string())
            .spawn(move || timer_loop(thread_inner))
            .expect("failed to spawn timer thread");

        Arc::new(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Arm (or re-arm) `key` to fire `f` after `delay`.
    pub fn arm(&self, key: TimerKey, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let mut entries = self.inner.entries.lock();
        entries.insert(key, (Instant::now() + delay, Box::new(f)));
        self.inner.cv.notify_all();
    }

    /// Cancel a pending timer. Returns true when one was pending.
    pub fn cancel(&self, key: TimerKey) -> bool {
        let mut entries = self.inner.entries.lock();
        entries.remove(&key).is_some()
    }

    /// Stop the timer thread, dropping pending entries.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cv.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(inner: Arc<TimerInner>) {
    let mut entries = inner.entries.lock();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let mut due: Vec<TimerFn> = Vec::new();
        let mut next: Option<Instant> = None;
        let keys: Vec<TimerKey> = entries.keys().copied().collect();
        for key in keys {
            let deadline = entries[&key].0;
            if deadline <= now {
                if let Some((_, f)) = entries.remove(&key) {
                    due.push(f);
                }
            } else {
                next = Some(next.map_or(deadline, |n| n.min(deadline)));
            }
        }

        if !due.is_empty() {
            drop(entries);
            for f in due {
                f();
            }
            entries = inner.entries.lock();
            continue;
        }

        match next {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let _ = inner.cv.wait_for(&mut entries, timeout);
            }
            None => inner.cv.wait(&mut entries),
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    const KEY: TimerKey = TimerKey {
        minor: 0,
        kind: TimerKind::Resync,
    };

    #[test]
    fn test_fires_after_delay() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timers.arm(KEY, Duration::from_millis(10), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
        timers.stop();
    }

    #[test]
    fn test_rearm_replaces() {
        let timers = TimerService::new();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let count = count.clone();
            timers.arm(KEY, Duration::from_millis(20), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        timers.stop();
    }

    #[test]
    fn test_cancel() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timers.arm(KEY, Duration::from_millis(30), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(timers.cancel(KEY));
        thread::sleep(Duration::from_millis(80));
        assert!(!fired.load(Ordering::SeqCst));
        timers.stop();
    }
}
