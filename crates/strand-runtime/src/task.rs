//! Tasks
//!
//! A task is one heap-allocated future (the compiler-built label/frame
//! machine of its body) plus the job and dispatcher it belongs to.
//!
//! ```text
//!            wake                 dispatcher runs it
//!   IDLE ──────────► SCHEDULED ─────────────────────► RUNNING
//!    ▲                                                 │  │
//!    │            poll returned Pending                │  │ woken while
//!    └─────────────────────────────────────────────────┘  │ running
//!                                                         ▼
//!   DONE ◄── poll returned Ready            NOTIFIED ──► re-dispatched
//! ```
//!
//! A task woken while it runs is re-dispatched after the poll instead of
//! being polled again in a loop, so a busy task cannot starve the others
//! on its dispatcher.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Context;

use futures::future::{BoxFuture, FutureExt};
use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;
use strand_core::error::{TaskError, TaskResult};
use strand_core::{kerror, ktrace, TaskId};

use crate::context::{self, TaskContext};
use crate::dispatcher::{resume_on, DispatcherRef, Runnable};
use crate::handle::RuntimeHandle;
use crate::job::Job;
use crate::reporter::ErrorReporter;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;

/// Where a finished body leaves its result for `Deferred`
pub(crate) type ResultSlot<T> = Arc<Mutex<Slot<T>>>;

pub(crate) enum Slot<T> {
    Empty,
    Ready(TaskResult<T>),
    Taken,
}

pub(crate) struct Task {
    id: TaskId,
    job: Job,
    dispatcher: DispatcherRef,
    handle: RuntimeHandle,
    state: AtomicU8,
    started: AtomicBool,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl Task {
    pub(crate) fn new(
        job: Job,
        dispatcher: DispatcherRef,
        handle: RuntimeHandle,
        future: BoxFuture<'static, ()>,
    ) -> Arc<Task> {
        Arc::new(Task {
            id: TaskId::next(),
            job,
            dispatcher,
            handle,
            state: AtomicU8::new(IDLE),
            started: AtomicBool::new(false),
            future: Mutex::new(Some(future)),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn job(&self) -> &Job {
        &self.job
    }

    /// Let a cancel of the job wake this task
    ///
    /// A lazy task that is cancelled before it starts is run once so it can
    /// finish its job.
    pub(crate) fn watch_cancellation(self: &Arc<Self>) {
        let waker = waker_ref(self);
        if !self.job.register_cancel_waker(&waker) {
            self.schedule();
        }
    }

    /// Start a task created lazily; `false` if it was already started
    pub(crate) fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.schedule();
        true
    }

    /// Run the first leg on the calling thread, up to the first suspension
    pub(crate) fn start_undispatched(self: &Arc<Self>) {
        self.started.store(true, Ordering::Release);
        if self
            .state
            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Arc::clone(self).run();
        }
    }

    fn schedule(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == IDLE {
            ktrace!("{:?} scheduled on {}", self.id, self.dispatcher.name());
            resume_on(&*self.dispatcher, self.runnable());
        }
    }

    fn runnable(self: &Arc<Self>) -> Runnable {
        let task = Arc::clone(self);
        Runnable::new(move || task.run())
    }

    fn run(self: Arc<Self>) {
        self.state.store(RUNNING, Ordering::Release);
        let ready = {
            let _ctx = context::enter(TaskContext {
                task_id: self.id,
                job: self.job.clone(),
                dispatcher: Arc::clone(&self.dispatcher),
                handle: self.handle.clone(),
            });
            let mut slot = self.future.lock();
            match slot.as_mut() {
                Some(future) => {
                    let waker = waker_ref(&self);
                    let mut cx = Context::from_waker(&waker);
                    let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
                    let ready = match polled {
                        Ok(poll) => poll.is_ready(),
                        Err(_) => {
                            kerror!("{:?} panicked outside its body", self.id);
                            true
                        }
                    };
                    if ready {
                        *slot = None;
                    }
                    ready
                }
                None => true,
            }
        };

        if ready {
            self.state.store(DONE, Ordering::Release);
            return;
        }
        if self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Woken during the poll
            self.state.store(SCHEDULED, Ordering::Release);
            resume_on(&*self.dispatcher, self.runnable());
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The future a task actually runs: body, result slot, job bookkeeping
///
/// A job cancelled before its task first runs never starts the body. A
/// failure the job tree leaves unhandled goes to `reporter`; the job kind
/// decides whether an awaiter owns it instead.
pub(crate) async fn run_body<T, Fut>(
    job: Job,
    body: Fut,
    slot: ResultSlot<T>,
    reporter: Arc<dyn ErrorReporter>,
) where
    Fut: Future<Output = TaskResult<T>>,
{
    let result = match job.cancel_error() {
        Some(err) => Err(err),
        None => match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked(panic_message(&*payload))),
        },
    };

    let failure = result.as_ref().err().cloned();
    *slot.lock() = Slot::Ready(result);

    let handled = job.finish_body(match &failure {
        Some(err) => Err(err),
        None => Ok(()),
    });
    if let (false, Some(err)) = (handled, &failure) {
        reporter.report(err);
    }
}
