//! Binary-heap timer queue
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy; the entry is skipped when it surfaces)
//! - Pop expired: O(k log n) for k expired entries
//! - Next deadline: O(1) amortized
//!
//! Generic over the deadline type so the real service can use `Instant` and
//! the manual clock a virtual `Duration`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use super::{TimerCallback, TimerHandle};

/// Compact once this many dead entries outnumber the live ones
const COMPACT_MIN: usize = 64;

struct Entry<T> {
    deadline: T,
    handle: TimerHandle,
    callback: TimerCallback,
}

impl<T: Ord> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl<T: Ord> Eq for Entry<T> {}

impl<T: Ord> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties fire in insertion order
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.handle.as_u64().cmp(&self.handle.as_u64()))
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerHeapStats {
    pub active: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

/// Min-heap of timers with lazy cancellation
pub struct TimerHeap<T> {
    heap: BinaryHeap<Entry<T>>,
    live: HashSet<TimerHandle>,
    stats: TimerHeapStats,
}

impl<T: Ord + Copy> TimerHeap<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            stats: TimerHeapStats::default(),
        }
    }

    pub fn insert(&mut self, deadline: T, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle::next();
        self.heap.push(Entry {
            deadline,
            handle,
            callback,
        });
        self.live.insert(handle);
        self.stats.total_inserted += 1;
        handle
    }

    /// Returns `false` if the timer already fired or was cancelled
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if !self.live.remove(&handle) {
            return false;
        }
        self.stats.total_cancelled += 1;
        let dead = self.heap.len() - self.live.len();
        if dead >= COMPACT_MIN && dead > self.live.len() {
            let live = &self.live;
            self.heap.retain(|e| live.contains(&e.handle));
        }
        true
    }

    /// Remove and return the earliest live timer due at or before `now`
    pub fn pop_due(&mut self, now: T) -> Option<TimerCallback> {
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                return None;
            }
            let entry = self.heap.pop()?;
            if self.live.remove(&entry.handle) {
                self.stats.total_fired += 1;
                return Some(entry.callback);
            }
        }
        None
    }

    /// Remove every live timer due at or before `now`, earliest first
    pub fn drain_due(&mut self, now: T) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        while let Some(cb) = self.pop_due(now) {
            due.push(cb);
        }
        due
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<T> {
        while let Some(top) = self.heap.peek() {
            if self.live.contains(&top.handle) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Live timers
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn stats(&self) -> TimerHeapStats {
        TimerHeapStats {
            active: self.live.len(),
            ..self.stats.clone()
        }
    }
}

impl<T: Ord + Copy> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, v: u32) -> TimerCallback {
        let log = Arc::clone(log);
        Box::new(move || log.lock().unwrap().push(v))
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut heap = TimerHeap::new();
        heap.insert(30u64, recorder(&log, 3));
        heap.insert(10u64, recorder(&log, 1));
        heap.insert(20u64, recorder(&log, 2));
        heap.insert(20u64, recorder(&log, 22));
        assert_eq!(heap.next_deadline(), Some(10));

        for cb in heap.drain_due(20) {
            cb();
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 22]);
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.next_deadline(), Some(30));
    }

    #[test]
    fn test_cancel_is_lazy_and_exact() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut heap = TimerHeap::new();
        let a = heap.insert(5u64, recorder(&log, 1));
        heap.insert(6u64, recorder(&log, 2));
        assert!(heap.cancel(a));
        assert!(!heap.cancel(a));
        assert_eq!(heap.next_deadline(), Some(6));

        for cb in heap.drain_due(100) {
            cb();
        }
        assert_eq!(*log.lock().unwrap(), vec![2]);
        let stats = heap.stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_compaction_keeps_live_entries() {
        let mut heap = TimerHeap::new();
        let handles: Vec<_> = (0..200u64).map(|i| heap.insert(i, Box::new(|| {}))).collect();
        for h in &handles[..150] {
            assert!(heap.cancel(*h));
        }
        assert_eq!(heap.len(), 50);
        assert!(heap.heap.len() < 200);
        assert_eq!(heap.next_deadline(), Some(150));
        assert_eq!(heap.drain_due(u64::MAX).len(), 50);
    }
}
