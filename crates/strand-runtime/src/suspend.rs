//! Cancellable suspension points
//!
//! Every suspension point the runtime provides goes through [`Cancellable`]:
//! before polling the awaited resource it checks the current job and arms
//! the task's waker for cancellation. A cancelled job therefore surfaces as
//! `Err(TaskError::Cancelled(..))` at the body's next suspension point.
//!
//! A loop with no suspension point cannot be cancelled. CPU-bound loops
//! should call [`ensure_active`] (or `check_cancellation!`) now and then.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use strand_core::error::{CancelReason, TaskResult};
use strand_core::Continuation;

use crate::context;
use crate::job::Job;

/// Wraps a future so it fails with the job's cancellation
///
/// Outside a task there is no job to observe and the inner future is
/// polled as is.
pub struct Cancellable<F> {
    inner: F,
}

impl<F: Future + Unpin> Cancellable<F> {
    pub fn new(inner: F) -> Self {
        Cancellable { inner }
    }
}

impl<F: Future + Unpin> Future for Cancellable<F> {
    type Output = TaskResult<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(job) = context::current_job() {
            if let Some(err) = job.poll_cancelled(cx) {
                return Poll::Ready(Err(err));
            }
        }
        Pin::new(&mut self.inner).poll(cx).map(Ok)
    }
}

/// Make any future a cancellable suspension point
pub fn cancellable<F: Future>(future: F) -> Cancellable<Pin<Box<F>>> {
    Cancellable::new(Box::pin(future))
}

/// Fail with the current job's cancellation, if any
pub fn ensure_active() -> TaskResult<()> {
    match context::current_job().and_then(|job| job.cancel_error()) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Suspend on a continuation handed to `register`
///
/// `register` stores the continuation with whatever will complete it. If
/// the job is cancelled first, the continuation is cancelled too, so a late
/// resume is dropped silently.
pub async fn suspend_cancellable<T, F>(register: F) -> TaskResult<T>
where
    F: FnOnce(Continuation<T>),
{
    ensure_active()?;
    let (k, suspended) = Continuation::new();
    register(k.clone());
    let guard = CancelOnDrop(k);
    let result = Cancellable::new(suspended).await;
    drop(guard);
    result?
}

struct CancelOnDrop<T>(Continuation<T>);

impl<T> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        self.0.cancel(CancelReason::Requested);
    }
}

/// Give other ready tasks a turn
///
/// The task is re-dispatched behind the work already queued on its
/// dispatcher. Also a cancellation point.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = TaskResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(job) = context::current_job() {
            if let Some(err) = job.poll_cancelled(cx) {
                return Poll::Ready(Err(err));
            }
        }
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Polls a block with `job` as the current job
///
/// The enclosing task is woken when `job` is cancelled, whatever the block
/// is suspended on.
pub(crate) struct InJob<F> {
    job: Job,
    inner: Pin<Box<F>>,
}

impl<F: Future> InJob<F> {
    pub(crate) fn new(job: Job, inner: F) -> Self {
        InJob {
            job,
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for InJob<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.job.register_cancel_waker(cx.waker());
        let _guard = context::override_job(self.job.clone());
        self.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestRuntime;
    use futures::executor::block_on;
    use std::sync::{Arc, Mutex};
    use strand_core::error::TaskError;

    #[test]
    fn test_outside_task_passes_through() {
        assert!(ensure_active().is_ok());
        assert_eq!(block_on(cancellable(async { 3 })).unwrap(), 3);
        assert!(block_on(yield_now()).is_ok());
    }

    #[test]
    fn test_suspension_point_observes_cancel() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let parked: Arc<Mutex<Option<Continuation<u32>>>> = Arc::new(Mutex::new(None));
        let p = Arc::clone(&parked);
        let cleaned = Arc::new(Mutex::new(false));
        let c = Arc::clone(&cleaned);
        let d = scope
            .spawn(move |_| async move {
                struct Cleanup(Arc<Mutex<bool>>);
                impl Drop for Cleanup {
                    fn drop(&mut self) {
                        *self.0.lock().unwrap() = true;
                    }
                }
                let _cleanup = Cleanup(c);
                suspend_cancellable(move |k| *p.lock().unwrap() = Some(k)).await
            })
            .unwrap();
        rt.run();
        let k = parked.lock().unwrap().take().unwrap();
        assert!(k.is_pending());

        d.cancel();
        rt.run();
        assert!(*cleaned.lock().unwrap());
        assert!(k.is_cancelled());
        // The late resume is dropped silently
        assert_eq!(k.resume(1), Ok(()));
        assert!(matches!(
            d.try_take(),
            Some(Err(TaskError::Cancelled(CancelReason::Requested)))
        ));
    }

    #[test]
    fn test_ensure_active_in_cpu_loop() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let iterations = Arc::new(Mutex::new(0u32));
        let it = Arc::clone(&iterations);
        let d = scope
            .spawn(move |scope| async move {
                let outcome: TaskResult<()> = loop {
                    if let Err(e) = ensure_active() {
                        break Err(e);
                    }
                    let n = {
                        let mut n = it.lock().unwrap();
                        *n += 1;
                        *n
                    };
                    if n == 5 {
                        scope.job().cancel();
                    }
                };
                outcome
            })
            .unwrap();
        rt.run();
        assert_eq!(*iterations.lock().unwrap(), 5);
        assert!(d.is_cancelled());
    }

    #[test]
    fn test_yield_interleaves_tasks() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let log = Arc::clone(&log);
            scope
                .launch(move |_| async move {
                    for i in 0..2 {
                        log.lock().unwrap().push(format!("{}{}", name, i));
                        yield_now().await?;
                    }
                    Ok(())
                })
                .unwrap();
        }
        rt.run();
        assert_eq!(*log.lock().unwrap(), vec!["a0", "b0", "a1", "b1"]);
    }
}
