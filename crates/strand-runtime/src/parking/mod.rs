//! Worker parking
//!
//! Idle pool workers sleep here until new work is submitted. Platform
//! implementations use the cheapest primitive available.

use std::time::Duration;

/// Sleep/wake primitive shared by the workers of one pool
///
/// A wake issued while nobody is parked is remembered, so a worker that
/// found its queues empty just before a submit does not sleep through it.
/// Spurious returns are allowed; callers re-check their queues either way.
pub trait WorkerParking: Send + Sync {
    /// Park the calling worker until woken or until `timeout` elapses
    ///
    /// Returns `true` if a wake was consumed, `false` on timeout.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake one parked worker
    fn wake_one(&self);

    /// Wake every parked worker (shutdown)
    fn wake_all(&self);

    /// Number of currently parked workers (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::CondvarParking as PlatformParking;
    }
}

/// Create the platform-appropriate parking instance
pub fn new_parking() -> Box<dyn WorkerParking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_times_out() {
        let parking = new_parking();
        let start = Instant::now();
        let woken = parking.park(Some(Duration::from_millis(30)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(parking.parked_count(), 0);
    }

    #[test]
    fn test_wake_before_park_is_remembered() {
        let parking = new_parking();
        parking.wake_one();
        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wake_one_releases_parked_thread() {
        let parking = Arc::new(PlatformParking::new());
        let p2 = Arc::clone(&parking);
        let handle = thread::spawn(move || p2.park(Some(Duration::from_secs(10))));

        while parking.parked_count() == 0 {
            thread::yield_now();
        }
        parking.wake_one();
        assert!(handle.join().unwrap());
    }
}
