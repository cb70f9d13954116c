//! Condvar parking for platforms without futex

use super::WorkerParking;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub struct CondvarParking {
    pending: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    parked: AtomicUsize,
}

impl CondvarParking {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn notify(&self, all: bool) {
        self.pending.store(true, Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) == 0 {
            return;
        }
        // Taking the lock orders us after a parker's pending check
        let _guard = self.lock.lock();
        if all {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }
}

impl Default for CondvarParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerParking for CondvarParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock.lock();
        let woken = if self.pending.swap(false, Ordering::SeqCst) {
            true
        } else {
            match timeout {
                Some(t) => {
                    let _ = self.cond.wait_for(&mut guard, t);
                }
                None => self.cond.wait(&mut guard),
            }
            self.pending.swap(false, Ordering::SeqCst)
        };
        drop(guard);
        self.parked.fetch_sub(1, Ordering::SeqCst);
        woken
    }

    fn wake_one(&self) {
        self.notify(false);
    }

    fn wake_all(&self) {
        self.notify(true);
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
