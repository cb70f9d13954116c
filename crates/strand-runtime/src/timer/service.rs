//! Timer thread
//!
//! One thread sleeps until the earliest deadline (bounded by
//! `max_poll_interval`) and runs due callbacks outside the heap lock.
//! Inserting an earlier deadline wakes the thread early.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strand_core::{kdebug, kerror};

use super::{HostClock, TimerCallback, TimerHandle, TimerHeap, TimerHeapStats};

/// Timer thread settings
#[derive(Debug, Clone)]
pub struct TimerServiceConfig {
    /// Longest sleep between polls even when nothing is due
    pub max_poll_interval: Duration,
    pub thread_name: String,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            max_poll_interval: Duration::from_millis(1),
            thread_name: "strand-timer".into(),
        }
    }
}

impl TimerServiceConfig {
    /// Poll rarely; deadlines still wake the thread on insert
    pub fn low_cpu() -> Self {
        Self {
            max_poll_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

struct Shared {
    heap: Mutex<TimerHeap<Instant>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// Real-time `HostClock` backed by a dedicated thread
pub struct TimerService {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Start the timer thread
    ///
    /// If the thread cannot be spawned the failure is logged and timers
    /// never fire.
    pub fn start(config: TimerServiceConfig) -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(TimerHeap::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let s = Arc::clone(&shared);
        let poll = config.max_poll_interval.max(Duration::from_micros(50));
        let thread = match thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || timer_loop(s, poll))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                kerror!("failed to spawn timer thread: {}", e);
                None
            }
        };
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Timers not yet fired or cancelled
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().len()
    }

    pub fn stats(&self) -> TimerHeapStats {
        self.shared.heap.lock().stats()
    }

    /// Stop the thread; pending timers are dropped without firing
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _heap = self.shared.heap.lock();
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl HostClock for TimerService {
    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let mut heap = self.shared.heap.lock();
        let earliest = heap.next_deadline().map_or(true, |d| deadline < d);
        let handle = heap.insert(deadline, callback);
        if earliest {
            self.shared.cond.notify_one();
        }
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.shared.heap.lock().cancel(handle)
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<Shared>, max_poll: Duration) {
    kdebug!("timer thread started");
    loop {
        let due = {
            let mut heap = shared.heap.lock();
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            let now = Instant::now();
            let due = heap.drain_due(now);
            if due.is_empty() {
                let wait = heap
                    .next_deadline()
                    .map_or(max_poll, |d| d.saturating_duration_since(now).min(max_poll));
                let _ = shared.cond.wait_for(&mut heap, wait);
                continue;
            }
            due
        };
        for callback in due {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                kerror!("timer callback panicked");
            }
        }
    }
    kdebug!("timer thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fires_after_delay() {
        let service = TimerService::start(TimerServiceConfig::default());
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        service.schedule_after(
            Duration::from_millis(20),
            Box::new(move || tx.send(Instant::now()).unwrap()),
        );
        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(20));
        service.shutdown();
    }

    #[test]
    fn test_order_and_cancel() {
        let service = TimerService::start(TimerServiceConfig::low_cpu());
        let (tx, rx) = mpsc::channel();
        let t1 = tx.clone();
        let t2 = tx.clone();
        service.schedule_after(Duration::from_millis(30), Box::new(move || t1.send(2).unwrap()));
        let h = service.schedule_after(Duration::from_millis(20), Box::new(move || tx.send(99).unwrap()));
        service.schedule_after(Duration::from_millis(10), Box::new(move || t2.send(1).unwrap()));
        assert!(service.cancel(h));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(!service.cancel(h));
        assert_eq!(service.pending(), 0);
    }
}
