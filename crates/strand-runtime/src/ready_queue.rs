//! Pool ready queue
//!
//! Go-style layout:
//! - one bounded local queue per worker slot (`ArrayQueue`)
//! - a shared unbounded injector (`SegQueue`)
//! - stealing from other workers' local queues when both are empty
//!
//! Submissions from a pool worker go to that worker's local queue; everything
//! else (timer thread, host threads, full local queue) goes to the injector.

use crossbeam_queue::{ArrayQueue, SegQueue};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::dispatcher::Runnable;

/// Local queue capacity per worker
pub const LOCAL_CAPACITY: usize = 256;

/// Check the injector every N pops so it cannot starve (Go uses 61)
const GLOBAL_CHECK_INTERVAL: usize = 61;

/// Victims tried per steal attempt
const STEAL_TRIES: usize = 4;

struct LocalSlot {
    queue: ArrayQueue<Runnable>,
    ticks: AtomicUsize,
    rng: AtomicUsize,
}

pub struct ReadyQueue {
    locals: Vec<LocalSlot>,
    injector: SegQueue<Runnable>,
}

impl ReadyQueue {
    /// Queue with one local slot per possible worker
    pub fn new(max_workers: usize) -> Self {
        let locals = (0..max_workers.max(1))
            .map(|i| LocalSlot {
                queue: ArrayQueue::new(LOCAL_CAPACITY),
                ticks: AtomicUsize::new(0),
                rng: AtomicUsize::new(i.wrapping_mul(2654435761).wrapping_add(1)),
            })
            .collect();
        Self {
            locals,
            injector: SegQueue::new(),
        }
    }

    /// Make a runnable ready, preferring `hint_worker`'s local queue
    pub fn push(&self, runnable: Runnable, hint_worker: Option<usize>) {
        let runnable = match hint_worker.and_then(|w| self.locals.get(w)) {
            Some(slot) => match slot.queue.push(runnable) {
                Ok(()) => return,
                Err(back) => back,
            },
            None => runnable,
        };
        self.injector.push(runnable);
    }

    /// Next runnable for `worker`: local, injector, then steal
    pub fn pop(&self, worker: usize) -> Option<Runnable> {
        let slot = self.locals.get(worker)?;

        let tick = slot.ticks.fetch_add(1, Ordering::Relaxed);
        if tick % GLOBAL_CHECK_INTERVAL == 0 {
            if let Some(r) = self.injector.pop() {
                return Some(r);
            }
        }

        if let Some(r) = slot.queue.pop() {
            return Some(r);
        }
        if let Some(r) = self.injector.pop() {
            return Some(r);
        }
        self.steal(worker)
    }

    fn steal(&self, thief: usize) -> Option<Runnable> {
        let n = self.locals.len();
        if n <= 1 {
            return None;
        }
        let rng = &self.locals[thief].rng;
        for _ in 0..STEAL_TRIES.min(n) {
            let next = rng
                .load(Ordering::Relaxed)
                .wrapping_mul(1103515245)
                .wrapping_add(12345);
            rng.store(next, Ordering::Relaxed);
            let victim = (next >> 8) % n;
            if victim == thief {
                continue;
            }
            if let Some(r) = self.locals[victim].queue.pop() {
                return Some(r);
            }
        }
        None
    }

    /// Approximate ready count (for diagnostics)
    pub fn len(&self) -> usize {
        self.injector.len() + self.locals.iter().map(|s| s.queue.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.injector.is_empty() && self.locals.iter().all(|s| s.queue.is_empty())
    }
}
