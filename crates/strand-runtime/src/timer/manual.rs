//! Virtual-time clock for deterministic tests

use std::time::Duration;

use parking_lot::Mutex;

use super::{HostClock, TimerCallback, TimerHandle, TimerHeap};

struct State {
    now: Duration,
    heap: TimerHeap<Duration>,
}

/// A `HostClock` whose time only moves when `advance` is called
///
/// Callbacks run on the thread calling `advance`, in deadline order, each
/// one after the clock has been moved to its deadline.
pub struct ManualClock {
    state: Mutex<State>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                now: Duration::ZERO,
                heap: TimerHeap::new(),
            }),
        }
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Move time forward, firing every timer that comes due
    ///
    /// Timers scheduled by the fired callbacks also fire if they fall
    /// inside the window. Returns how many callbacks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        self.advance_to(target)
    }

    pub fn advance_to(&self, target: Duration) -> usize {
        let mut fired = 0;
        loop {
            let callback = {
                let mut state = self.state.lock();
                match state.heap.next_deadline() {
                    Some(deadline) if deadline <= target => {
                        state.now = state.now.max(deadline);
                        state.heap.pop_due(deadline)
                    }
                    _ => {
                        state.now = state.now.max(target);
                        None
                    }
                }
            };
            match callback {
                Some(cb) => {
                    cb();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    /// Timers not yet fired or cancelled
    pub fn pending(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Deadline of the next timer, relative to now
    pub fn next_due_in(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = state.now;
        state.heap.next_deadline().map(|d| d.saturating_sub(now))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for ManualClock {
    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        state.heap.insert(deadline, callback)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.state.lock().heap.cancel(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn test_advance_fires_in_order() {
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(StdMutex::new(Vec::new()));
        for (delay, tag) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let log = Arc::clone(&log);
            let c = Arc::clone(&clock);
            clock.schedule_after(
                Duration::from_millis(delay),
                Box::new(move || log.lock().unwrap().push((tag, c.now()))),
            );
        }
        assert_eq!(clock.advance(Duration::from_millis(15)), 1);
        assert_eq!(clock.now(), Duration::from_millis(15));
        assert_eq!(clock.next_due_in(), Some(Duration::from_millis(5)));
        assert_eq!(clock.advance(Duration::from_millis(100)), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("a", Duration::from_millis(10)),
                ("b", Duration::from_millis(20)),
                ("c", Duration::from_millis(30)),
            ]
        );
        assert_eq!(clock.now(), Duration::from_millis(115));
    }

    #[test]
    fn test_rescheduled_inside_window_fires() {
        let clock = Arc::new(ManualClock::new());
        let hits = Arc::new(StdMutex::new(0));
        let (c, h) = (Arc::clone(&clock), Arc::clone(&hits));
        clock.schedule_after(
            Duration::from_millis(10),
            Box::new(move || {
                *h.lock().unwrap() += 1;
                let h2 = Arc::clone(&h);
                c.schedule_after(Duration::from_millis(10), Box::new(move || *h2.lock().unwrap() += 1));
            }),
        );
        assert_eq!(clock.advance(Duration::from_millis(25)), 2);
        assert_eq!(*hits.lock().unwrap(), 2);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_cancel() {
        let clock = ManualClock::new();
        let h = clock.schedule_after(Duration::from_millis(1), Box::new(|| panic!("cancelled")));
        assert!(clock.cancel(h));
        assert_eq!(clock.advance(Duration::from_millis(5)), 0);
    }
}
