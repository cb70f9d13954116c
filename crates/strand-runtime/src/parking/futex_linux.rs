//! Linux futex parking
//!
//! Futex word: 0 = no wake pending, 1 = wake pending. Wakers always set the
//! word and only enter the kernel when someone is parked; a parking worker
//! consumes a pending wake instead of sleeping.

use super::WorkerParking;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

const IDLE: u32 = 0;
const WAKE_PENDING: u32 = 1;

pub struct FutexParking {
    word: AtomicU32,
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(IDLE),
            parked: AtomicUsize::new(0),
        }
    }

    fn futex_wait(&self, timeout: Option<Duration>) -> bool {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        // Safety: the futex word outlives the call; FUTEX_WAIT only reads it
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                IDLE,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return true;
        }
        // EAGAIN: the word changed before we slept, i.e. a wake raced us
        let errno = std::io::Error::last_os_error().raw_os_error();
        errno == Some(libc::EAGAIN)
    }

    fn futex_wake(&self, n: i32) {
        // Safety: see futex_wait
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerParking for FutexParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let woken = if self.word.swap(IDLE, Ordering::SeqCst) == WAKE_PENDING {
            true
        } else {
            let woken = self.futex_wait(timeout);
            // Consume the flag that woke us (or one that raced the timeout)
            self.word.swap(IDLE, Ordering::SeqCst) == WAKE_PENDING || woken
        };
        self.parked.fetch_sub(1, Ordering::SeqCst);
        woken
    }

    fn wake_one(&self) {
        self.word.store(WAKE_PENDING, Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.futex_wake(1);
        }
    }

    fn wake_all(&self) {
        self.word.store(WAKE_PENDING, Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.futex_wake(i32::MAX);
        }
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
