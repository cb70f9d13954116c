//! In-process host queue drained by its owning thread

use std::collections::VecDeque;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::HostQueue;

type Callback = Box<dyn FnOnce() + Send>;

/// Longest single wait while the loop is idle
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// A FIFO callback queue owned by the thread that created it
///
/// Other threads `post`; the owner drains with `run_once`, `run_until_idle`
/// or `run_until`. Used by `Runtime::block_on` and as a deterministic main
/// queue in tests.
pub struct EventLoop {
    queue: Mutex<VecDeque<Callback>>,
    cond: Condvar,
    owner: ThreadId,
}

impl EventLoop {
    /// Create a loop owned by the calling thread
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            owner: thread::current().id(),
        }
    }

    /// Run one queued callback; `false` if the queue was empty
    pub fn run_once(&self) -> bool {
        let next = self.queue.lock().pop_front();
        match next {
            Some(cb) => {
                cb();
                true
            }
            None => false,
        }
    }

    /// Run callbacks until the queue is empty, including ones posted
    /// while draining. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    /// Drain and wait for posts until `done()` holds or `timeout` elapses
    ///
    /// Returns whether `done()` became true.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if done() {
                return true;
            }
            if self.run_once() {
                continue;
            }
            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return done();
                    }
                    (d - now).min(IDLE_WAIT)
                }
                None => IDLE_WAIT,
            };
            let mut q = self.queue.lock();
            if q.is_empty() {
                let _ = self.cond.wait_for(&mut q, wait);
            }
        }
    }

    /// Wake a thread blocked in `run_until` without posting
    pub fn notify(&self) {
        let _q = self.queue.lock();
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl HostQueue for EventLoop {
    fn post(&self, callback: Box<dyn FnOnce() + Send>) {
        self.queue.lock().push_back(callback);
        self.cond.notify_one();
    }

    fn is_on_queue(&self) -> bool {
        thread::current().id() == self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_run_until_idle_includes_reposts() {
        let event_loop = Arc::new(EventLoop::new());
        let count = Arc::new(AtomicUsize::new(0));
        let (l, c) = (Arc::clone(&event_loop), Arc::clone(&count));
        event_loop.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c);
            l.post(Box::new(move || {
                c2.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        assert_eq!(event_loop.run_until_idle(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(event_loop.is_empty());
    }

    #[test]
    fn test_run_until_waits_for_cross_thread_post() {
        let event_loop = Arc::new(EventLoop::new());
        let count = Arc::new(AtomicUsize::new(0));
        let (l, c) = (Arc::clone(&event_loop), Arc::clone(&count));
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            assert!(!l.is_on_queue());
            l.post(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        });
        let ok = event_loop.run_until(
            || count.load(Ordering::SeqCst) == 1,
            Some(Duration::from_secs(5)),
        );
        assert!(ok);
        t.join().unwrap();
    }

    #[test]
    fn test_run_until_times_out() {
        let event_loop = EventLoop::new();
        let start = Instant::now();
        assert!(!event_loop.run_until(|| false, Some(Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
