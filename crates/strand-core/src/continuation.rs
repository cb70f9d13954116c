//! One-shot continuations
//!
//! A `Continuation<T>` is the resume half of a suspension point: whoever
//! completes the awaited resource calls `resume` exactly once. The paired
//! `Suspended<T>` is the future the suspended task is parked on.
//!
//! ```text
//!   task                          resource owner
//!   ────                          ──────────────
//!   let (k, s) = Continuation::new();
//!   register(k) ───────────────►  stores k
//!   s.await   (Pending)
//!                                 k.resume(v)  ──► wakes task
//!   s.await   (Ready(Ok(v)))
//! ```
//!
//! A second `resume` is a contract violation. A resume that arrives after
//! the continuation was cancelled is dropped silently.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use parking_lot::Mutex;

use crate::error::{CancelReason, ContractViolation, TaskError, TaskResult};

const PENDING: u8 = 0;
const RESUMED: u8 = 1;
const CANCELLED: u8 = 2;

struct Shared<T> {
    state: AtomicU8,
    slot: Mutex<Option<TaskResult<T>>>,
    waker: AtomicWaker,
}

/// Resume handle for one suspension point
pub struct Continuation<T> {
    shared: Arc<Shared<T>>,
}

/// Future side of a continuation
pub struct Suspended<T> {
    shared: Arc<Shared<T>>,
    taken: bool,
}

impl<T> Continuation<T> {
    /// Create a continuation and the future it resumes
    pub fn new() -> (Continuation<T>, Suspended<T>) {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(PENDING),
            slot: Mutex::new(None),
            waker: AtomicWaker::new(),
        });
        (
            Continuation {
                shared: Arc::clone(&shared),
            },
            Suspended {
                shared,
                taken: false,
            },
        )
    }

    /// Resume with a result
    ///
    /// Returns `AlreadyResumed` if this continuation was resumed before.
    /// A resume after `cancel` is ignored and returns `Ok`.
    pub fn try_resume_with(&self, result: TaskResult<T>) -> Result<(), ContractViolation> {
        {
            let mut slot = self.shared.slot.lock();
            match self.shared.state.load(Ordering::Acquire) {
                PENDING => {
                    *slot = Some(result);
                    self.shared.state.store(RESUMED, Ordering::Release);
                }
                CANCELLED => return Ok(()),
                _ => return Err(ContractViolation::AlreadyResumed),
            }
        }
        self.shared.waker.wake();
        Ok(())
    }

    /// Resume with a value
    pub fn resume(&self, value: T) -> Result<(), ContractViolation> {
        self.try_resume_with(Ok(value))
    }

    /// Resume with an error
    pub fn resume_with_error(&self, err: TaskError) -> Result<(), ContractViolation> {
        self.try_resume_with(Err(err))
    }

    /// Cancel the suspension point
    ///
    /// The waiting side observes `TaskError::Cancelled(reason)`. Returns
    /// `false` if the continuation had already been resumed or cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut slot = self.shared.slot.lock();
            if self.shared.state.load(Ordering::Acquire) != PENDING {
                return false;
            }
            *slot = Some(Err(TaskError::Cancelled(reason)));
            self.shared.state.store(CANCELLED, Ordering::Release);
        }
        self.shared.waker.wake();
        true
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == PENDING
    }

    #[inline]
    pub fn is_resumed(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == RESUMED
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl<T> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Continuation {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.shared.state.load(Ordering::Relaxed) {
            PENDING => "pending",
            RESUMED => "resumed",
            _ => "cancelled",
        };
        f.debug_struct("Continuation").field("state", &state).finish()
    }
}

impl<T> Suspended<T> {
    /// Take the result without registering a waker
    pub fn try_take(&mut self) -> Option<TaskResult<T>> {
        if self.taken {
            return None;
        }
        let out = self.shared.slot.lock().take();
        if out.is_some() {
            self.taken = true;
        }
        out
    }
}

impl<T> Future for Suspended<T> {
    type Output = TaskResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.taken {
            return Poll::Ready(Err(ContractViolation::ResultAlreadyTaken.into()));
        }
        // Register before checking so a concurrent resume is not missed
        this.shared.waker.register(cx.waker());
        match this.try_take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    fn poll_once<T>(s: &mut Suspended<T>) -> Poll<TaskResult<T>> {
        let mut cx = Context::from_waker(noop_waker_ref());
        Pin::new(s).poll(&mut cx)
    }

    #[test]
    fn test_resume_once() {
        let (k, mut s) = Continuation::new();
        assert!(poll_once(&mut s).is_pending());
        k.resume(5).unwrap();
        assert!(k.is_resumed());
        match poll_once(&mut s) {
            Poll::Ready(Ok(5)) => {}
            other => panic!("unexpected {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn test_double_resume_is_contract_violation() {
        let (k, _s) = Continuation::new();
        k.resume(1).unwrap();
        assert_eq!(k.resume(2), Err(ContractViolation::AlreadyResumed));
        let k2 = k.clone();
        assert_eq!(
            k2.resume_with_error(TaskError::msg("late")),
            Err(ContractViolation::AlreadyResumed)
        );
    }

    #[test]
    fn test_resume_after_cancel_is_ignored() {
        let (k, mut s) = Continuation::<u32>::new();
        assert!(k.cancel(CancelReason::Requested));
        assert!(!k.cancel(CancelReason::Requested));
        assert_eq!(k.resume(9), Ok(()));
        match poll_once(&mut s) {
            Poll::Ready(Err(TaskError::Cancelled(CancelReason::Requested))) => {}
            _ => panic!("expected cancellation"),
        }
    }

    #[test]
    fn test_poll_after_ready() {
        let (k, mut s) = Continuation::new();
        k.resume(()).unwrap();
        assert!(matches!(poll_once(&mut s), Poll::Ready(Ok(()))));
        assert!(matches!(
            poll_once(&mut s),
            Poll::Ready(Err(TaskError::Contract(ContractViolation::ResultAlreadyTaken)))
        ));
    }

    #[test]
    fn test_resume_from_other_thread() {
        let (k, s) = Continuation::new();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            k.resume(String::from("done")).unwrap();
        });
        let out = futures::executor::block_on(s).unwrap();
        assert_eq!(out, "done");
        t.join().unwrap();
    }
}
