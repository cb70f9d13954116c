//! Timer suspension points
//!
//! `delay` parks the task on a host-clock timer. `with_timeout` races a
//! block against a timer: when the timer wins, the block's job is cancelled
//! with `CancelReason::Deadline`, the block unwinds through its cleanup at
//! its next suspension point, and the caller gets `TaskError::Timeout`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use strand_core::error::{CancelReason, ContractViolation, TaskError, TaskResult};
use strand_core::{JobKind, Suspended};
use strand_core::{ktrace, Continuation};

use crate::context;
use crate::suspend::InJob;
use crate::timer::{HostClock, TimerHandle};

struct Armed {
    clock: Arc<dyn HostClock>,
    handle: TimerHandle,
    fired: Suspended<()>,
}

/// Future returned by [`delay`]
pub struct Delay {
    duration: Duration,
    armed: Option<Armed>,
}

/// Suspend the current task for `duration`
///
/// Must be awaited inside a task (`NoTaskContext` otherwise). A zero
/// duration still checks for cancellation.
pub fn delay(duration: Duration) -> Delay {
    Delay {
        duration,
        armed: None,
    }
}

impl Future for Delay {
    type Output = TaskResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let ctx = match context::current() {
            Some(ctx) => ctx,
            None => return Poll::Ready(Err(ContractViolation::NoTaskContext.into())),
        };
        if let Some(err) = ctx.job.poll_cancelled(cx) {
            self.disarm();
            return Poll::Ready(Err(err));
        }
        if self.duration.is_zero() {
            return Poll::Ready(Ok(()));
        }

        if self.armed.is_none() {
            let (k, fired) = Continuation::new();
            let clock = Arc::clone(ctx.handle.clock());
            let handle = clock.schedule_after(
                self.duration,
                Box::new(move || {
                    let _ = k.resume(());
                }),
            );
            ktrace!("delay {:?} armed as {:?}", self.duration, handle);
            self.armed = Some(Armed {
                clock,
                handle,
                fired,
            });
        }

        let armed = match self.armed.as_mut() {
            Some(armed) => armed,
            None => return Poll::Pending,
        };
        match Pin::new(&mut armed.fired).poll(cx) {
            Poll::Ready(result) => {
                self.armed = None;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Delay {
    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.clock.cancel(armed.handle);
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Run `body` with a deadline
///
/// On expiry the body's job (and everything launched in it) is cancelled
/// with `Deadline`; once the body has unwound the caller receives
/// `TaskError::Timeout(duration)`. A failure inside the body is returned
/// here rather than propagated to the caller's job.
pub async fn with_timeout<T, Fut>(duration: Duration, body: Fut) -> TaskResult<T>
where
    Fut: Future<Output = TaskResult<T>>,
{
    let ctx = context::current().ok_or(TaskError::Contract(ContractViolation::NoTaskContext))?;
    if let Some(err) = ctx.job.cancel_error() {
        return Err(err);
    }
    let job = ctx.job.scoped_child(JobKind::Plain)?;

    let deadline_job = job.clone();
    let clock = Arc::clone(ctx.handle.clock());
    let timer = clock.schedule_after(
        duration,
        Box::new(move || {
            deadline_job.cancel_with(TaskError::Cancelled(CancelReason::Deadline));
        }),
    );

    let result = InJob::new(job.clone(), body).await;
    clock.cancel(timer);
    job.finish_body(result.as_ref().map(|_| ()));
    job.terminated().await;

    match job.completion_error() {
        Some(TaskError::Cancelled(CancelReason::Deadline)) => Err(TaskError::Timeout(duration)),
        Some(err) => Err(err),
        None => result,
    }
}

/// Like [`with_timeout`], but expiry yields `Ok(None)`
pub async fn with_timeout_or_none<T, Fut>(duration: Duration, body: Fut) -> TaskResult<Option<T>>
where
    Fut: Future<Output = TaskResult<T>>,
{
    match with_timeout(duration, body).await {
        Ok(value) => Ok(Some(value)),
        Err(TaskError::Timeout(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
