//! Parallelism-limited view over another dispatcher
//!
//! Runnables queue here; at most `limit` drain loops are dispatched to the
//! base at any time. A drain loop runs queued runnables one after another,
//! handing its permit back when the queue empties. After `FAIR_BUDGET`
//! runnables it re-dispatches itself so other work on the base gets a turn.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use strand_core::kerror;

use super::{Dispatcher, DispatcherRef, Runnable};

const FAIR_BUDGET: usize = 16;

struct LimitedInner {
    base: DispatcherRef,
    limit: usize,
    queue: SegQueue<Runnable>,
    running: AtomicUsize,
    name: String,
}

/// Bounds how many runnables execute concurrently on `base`
#[derive(Clone)]
pub struct LimitedDispatcher {
    inner: Arc<LimitedInner>,
}

impl LimitedDispatcher {
    /// `limit` is clamped to at least one
    pub fn new(base: DispatcherRef, limit: usize) -> Self {
        let limit = limit.max(1);
        let name = format!("{}[{}]", base.name(), limit);
        Self::with_name(base, limit, name)
    }

    pub fn with_name(base: DispatcherRef, limit: usize, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LimitedInner {
                base,
                limit: limit.max(1),
                queue: SegQueue::new(),
                running: AtomicUsize::new(0),
                name: name.into(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Drain loops currently holding a permit
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Runnables waiting for a permit
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }
}

impl LimitedInner {
    fn try_acquire(&self) -> bool {
        let mut cur = self.running.load(Ordering::Acquire);
        loop {
            if cur >= self.limit {
                return false;
            }
            match self.running.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn start_drain(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.base.dispatch(Runnable::new(move || me.drain()));
    }

    fn drain(self: Arc<Self>) {
        let mut budget = FAIR_BUDGET;
        loop {
            match self.queue.pop() {
                Some(runnable) => {
                    if catch_unwind(AssertUnwindSafe(|| runnable.run())).is_err() {
                        kerror!("runnable panicked on {}", self.name);
                    }
                    budget -= 1;
                    if budget == 0 {
                        if !self.queue.is_empty() {
                            // Keep the permit, yield the carrier
                            self.start_drain();
                            return;
                        }
                        budget = FAIR_BUDGET;
                    }
                }
                None => {
                    self.running.fetch_sub(1, Ordering::AcqRel);
                    // A dispatch may have queued work and lost the permit race
                    if self.queue.is_empty() || !self.try_acquire() {
                        return;
                    }
                }
            }
        }
    }
}

impl Dispatcher for LimitedDispatcher {
    fn dispatch(&self, runnable: Runnable) {
        self.inner.queue.push(runnable);
        if self.inner.try_acquire() {
            self.inner.start_drain();
        }
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{limited_parallelism, PoolDispatcher};
    use crate::worker::{PoolConfig, WorkerPool};
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool(max: usize) -> WorkerPool {
        WorkerPool::new(
            "limited-test",
            PoolConfig {
                core_workers: max,
                max_workers: max,
                idle_spins: 2,
                park_timeout: Duration::from_millis(10),
                keep_alive: Duration::from_secs(1),
            },
        )
    }

    #[test]
    fn test_never_exceeds_limit() {
        let pool = pool(8);
        let base: DispatcherRef = Arc::new(PoolDispatcher::new(pool.clone()));
        let limited = LimitedDispatcher::new(base, 2);

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..40 {
            let (active, peak, tx) = (active.clone(), peak.clone(), tx.clone());
            limited.dispatch(Runnable::new(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
                active.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..40 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        pool.shutdown();
    }

    #[test]
    fn test_two_views_share_one_pool() {
        let pool = pool(4);
        let base: DispatcherRef = Arc::new(PoolDispatcher::new(pool.clone()));
        let cpu = limited_parallelism(base.clone(), 1);
        let io = limited_parallelism(base, 3);
        assert_eq!(cpu.name(), "limited-test[1]");

        let (tx, rx) = mpsc::channel();
        for d in [&cpu, &io] {
            for _ in 0..10 {
                let tx = tx.clone();
                d.dispatch(Runnable::new(move || tx.send(()).unwrap()));
            }
        }
        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        assert!(pool.live_workers() <= 4);
        pool.shutdown();
    }

    #[test]
    fn test_limit_clamped_to_one() {
        let base: DispatcherRef = Arc::new(crate::dispatcher::Unconfined);
        let limited = LimitedDispatcher::new(base, 0);
        assert_eq!(limited.limit(), 1);
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        limited.dispatch(Runnable::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(limited.running(), 0);
    }
}
