//! Per-thread task context
//!
//! While a task is being polled, its thread-local context names the task,
//! the job suspension points check for cancellation, the dispatcher it
//! resumes on and the runtime handle. Scoped blocks (`scoped`,
//! `with_timeout`) temporarily replace the job so the block's suspension
//! points observe the block's own job.

use std::cell::RefCell;

use strand_core::kprint;
use strand_core::TaskId;

use crate::dispatcher::DispatcherRef;
use crate::handle::RuntimeHandle;
use crate::job::Job;

thread_local! {
    static CURRENT: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

/// What a running task can see about itself
#[derive(Clone)]
pub struct TaskContext {
    pub(crate) task_id: TaskId,
    pub(crate) job: Job,
    pub(crate) dispatcher: DispatcherRef,
    pub(crate) handle: RuntimeHandle,
}

impl TaskContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The job cancellation is checked against (the innermost scoped block's)
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn dispatcher(&self) -> &DispatcherRef {
        &self.dispatcher
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }
}

/// Restores the previous context on drop
pub(crate) struct EnterGuard {
    prev: Option<TaskContext>,
}

/// Install `ctx` for the duration of one poll
pub(crate) fn enter(ctx: TaskContext) -> EnterGuard {
    kprint::set_task_id(ctx.task_id.as_u64());
    let prev = CURRENT.with(|c| c.borrow_mut().replace(ctx));
    EnterGuard { prev }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        match &prev {
            Some(ctx) => kprint::set_task_id(ctx.task_id.as_u64()),
            None => kprint::clear_task_id(),
        }
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// Restores the replaced job on drop
pub(crate) struct JobGuard {
    prev: Option<Job>,
}

/// Make `job` the current job until the guard drops
///
/// Outside a task this does nothing.
pub(crate) fn override_job(job: Job) -> JobGuard {
    let prev = CURRENT.with(|c| {
        c.borrow_mut()
            .as_mut()
            .map(|ctx| std::mem::replace(&mut ctx.job, job))
    });
    JobGuard { prev }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if let Some(job) = self.prev.take() {
            CURRENT.with(|c| {
                if let Some(ctx) = c.borrow_mut().as_mut() {
                    ctx.job = job;
                }
            });
        }
    }
}

/// Snapshot of the running task's context
pub fn current() -> Option<TaskContext> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The job of the running task (or of the innermost scoped block)
pub fn current_job() -> Option<Job> {
    CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.job.clone()))
}

pub fn current_task_id() -> Option<TaskId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.task_id))
}

pub fn is_in_task() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}
