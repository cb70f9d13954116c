//! Timer subsystem
//!
//! Timer suspension points (`delay`, `with_timeout`) only need a host clock
//! that runs a callback after a delay:
//!
//! ```text
//!      delay / with_timeout
//!               │ schedule_after(d, callback)
//!               ▼
//!        ┌──────────────┐
//!        │ dyn HostClock│
//!        └──────────────┘
//!           │          │
//!           ▼          ▼
//!   TimerService    ManualClock
//!   (timer thread)  (virtual time, tests)
//!           │          │
//!           └─► TimerHeap ◄─┘
//! ```

mod heap;
mod manual;
mod service;

pub use heap::{TimerHeap, TimerHeapStats};
pub use manual::ManualClock;
pub use service::{TimerService, TimerServiceConfig};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Callback run when a timer fires
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Cancellation handle for one scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Allocate a process-unique handle
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Host clock obligation
///
/// `schedule_after` runs `callback` once, on a thread of the clock's
/// choosing, no earlier than `delay` from now. `cancel` is best-effort and
/// returns `false` if the timer already fired or was cancelled.
pub trait HostClock: Send + Sync {
    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    fn cancel(&self, handle: TimerHandle) -> bool;
}
