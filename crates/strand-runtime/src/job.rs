//! Job tree
//!
//! A job is the lifecycle and cancellation node of one task or scope.
//! Parents own their non-terminal children; children keep a weak,
//! lookup-only reference back to the parent which is dropped when the
//! child becomes terminal.
//!
//! # Completion
//!
//! A job finishes when its body is done *and* every child is terminal:
//!
//! - body returned normally: `Active -> Completing -> Completed`
//! - cancel or failure: `-> Cancelling -> Cancelled`
//!
//! Bodiless jobs (scope roots) count their body as done once `complete()`
//! or a cancel is called.
//!
//! # Failure propagation
//!
//! A failing child asks its parent to take the failure (`child_failed`).
//! A plain parent cancels itself and every sibling and passes the failure
//! on upward; a supervisor refuses, leaving the failure with the child. A
//! rethrowing job (`scoped`, `with_timeout`) takes the failure and stops
//! it there, because its caller receives it as a return value.
//!
//! A failure nobody above takes belongs to the topmost launched task on
//! its path. That covers a `spawn` failure escalating through a `launch`:
//! the `Deferred` no longer owns it. The failing task reports it exactly
//! once.
//!
//! Wakers and completion handlers always run outside the job lock.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use strand_core::error::{CancelReason, ContractViolation, TaskError, TaskResult};
use strand_core::{kdebug, kerror};
use strand_core::{JobId, JobKind, JobState};

use crate::suspend::Cancellable;

type CompletionHandler = Box<dyn FnOnce(Option<&TaskError>) + Send>;

struct Core {
    state: JobState,
    parent: Option<Weak<JobInner>>,
    /// Non-terminal children only
    children: Vec<Job>,
    cause: Option<TaskError>,
    handlers: Vec<CompletionHandler>,
    /// Woken once, when the job starts cancelling
    cancel_wakers: Vec<Waker>,
    /// Woken once, at the terminal state
    join_wakers: Vec<Waker>,
    body_done: bool,
}

struct JobInner {
    id: JobId,
    kind: JobKind,
    has_body: bool,
    rethrows: bool,
    /// Launched task: an unclaimed failure reaching it gets reported
    reports: bool,
    /// Mirror of `core.state` for lock-free reads
    state: AtomicU8,
    core: Mutex<Core>,
}

/// Where an escalated failure ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    /// Taken by a rethrowing job, an earlier failure, or a cancellation
    Handled,
    /// No ancestor took it; the awaiter of the failing task owns it
    Unclaimed,
    /// Must go to the error reporter
    Report,
}

/// Handle to a node of the job tree
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

fn push_waker(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

impl Job {
    fn alloc(parent: Option<&Job>, kind: JobKind, has_body: bool, rethrows: bool, reports: bool) -> Job {
        Job {
            inner: Arc::new(JobInner {
                id: JobId::next(),
                kind,
                has_body,
                rethrows,
                reports,
                state: AtomicU8::new(JobState::Active.into()),
                core: Mutex::new(Core {
                    state: JobState::Active,
                    parent: parent.map(|p| Arc::downgrade(&p.inner)),
                    children: Vec::new(),
                    cause: None,
                    handlers: Vec::new(),
                    cancel_wakers: Vec::new(),
                    join_wakers: Vec::new(),
                    body_done: false,
                }),
            }),
        }
    }

    fn attach(&self, kind: JobKind, has_body: bool, rethrows: bool, reports: bool) -> TaskResult<Job> {
        let job = Job::alloc(Some(self), kind, has_body, rethrows, reports);
        let mut core = self.inner.core.lock();
        if !core.state.accepts_children() {
            return Err(ContractViolation::AttachToInactiveJob.into());
        }
        core.children.push(job.clone());
        Ok(job)
    }

    /// Root job; completes when `complete()` is called and its children are done
    #[allow(clippy::new_without_default)]
    pub fn new() -> Job {
        Job::alloc(None, JobKind::Plain, false, false, false)
    }

    /// Root supervisor job
    pub fn supervisor() -> Job {
        Job::alloc(None, JobKind::Supervisor, false, false, false)
    }

    /// Bodiless child
    ///
    /// Fails with `AttachToInactiveJob` once this job is cancelling or terminal.
    pub fn child(&self) -> TaskResult<Job> {
        self.attach(JobKind::Plain, false, false, false)
    }

    /// Bodiless supervisor child
    pub fn supervisor_child(&self) -> TaskResult<Job> {
        self.attach(JobKind::Supervisor, false, false, false)
    }

    /// Child driven by a launched task body
    pub(crate) fn task_child(&self) -> TaskResult<Job> {
        self.attach(JobKind::Plain, true, false, true)
    }

    /// Child driven by a task whose result is awaited through a `Deferred`
    pub(crate) fn deferred_child(&self) -> TaskResult<Job> {
        self.attach(JobKind::Plain, true, false, false)
    }

    /// Child whose failure is returned to the caller instead of propagated
    pub(crate) fn scoped_child(&self, kind: JobKind) -> TaskResult<Job> {
        self.attach(kind, true, true, false)
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn kind(&self) -> JobKind {
        self.inner.kind
    }

    #[inline]
    pub fn state(&self) -> JobState {
        JobState::from(self.inner.state.load(Ordering::Acquire))
    }

    /// Active or Completing
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Cancelling or Cancelled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state() == JobState::Completed
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// The parent, while this job is not terminal and the parent is alive
    pub fn parent(&self) -> Option<Job> {
        let core = self.inner.core.lock();
        core.parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Job { inner })
    }

    /// Children that have not reached a terminal state
    pub fn children(&self) -> Vec<Job> {
        self.inner.core.lock().children.clone()
    }

    /// What cancelled this job: the requested reason or the failure
    pub fn cancellation_cause(&self) -> Option<TaskError> {
        self.inner.core.lock().cause.clone()
    }

    fn set_state(&self, core: &mut Core, state: JobState) {
        core.state = state;
        self.inner.state.store(state.into(), Ordering::Release);
    }

    /// Request cancellation with `CancelReason::Requested`
    pub fn cancel(&self) -> bool {
        self.cancel_with(TaskError::Cancelled(CancelReason::Requested))
    }

    /// Cancel with an explicit cause
    ///
    /// Children are cancelled with `ParentCancelled`. Returns `false` if
    /// the job was already cancelling or terminal.
    pub fn cancel_with(&self, cause: TaskError) -> bool {
        let (children, wakers) = {
            let mut core = self.inner.core.lock();
            if !core.state.is_active() {
                return false;
            }
            self.set_state(&mut core, JobState::Cancelling);
            core.cause = Some(cause);
            if !self.inner.has_body {
                core.body_done = true;
            }
            (core.children.clone(), std::mem::take(&mut core.cancel_wakers))
        };
        kdebug!("{:?} cancelling", self.inner.id);

        for waker in wakers {
            waker.wake();
        }
        for child in children {
            child.cancel_with(TaskError::Cancelled(CancelReason::ParentCancelled));
        }
        self.try_finalize();
        true
    }

    /// Finish a bodiless job once its children are done
    ///
    /// Returns `false` for task jobs and jobs that are no longer `Active`.
    pub fn complete(&self) -> bool {
        {
            let mut core = self.inner.core.lock();
            if self.inner.has_body || core.state != JobState::Active {
                return false;
            }
            core.body_done = true;
            self.set_state(&mut core, JobState::Completing);
        }
        self.try_finalize();
        true
    }

    /// Record that the body finished with `outcome`
    ///
    /// Returns whether a failure was taken care of; `false` means the
    /// caller should report it.
    pub(crate) fn finish_body(&self, outcome: Result<(), &TaskError>) -> bool {
        let (newly_failed, children, wakers) = {
            let mut core = self.inner.core.lock();
            core.body_done = true;
            match outcome {
                Ok(()) if core.state == JobState::Active => {
                    self.set_state(&mut core, JobState::Completing);
                    (false, Vec::new(), Vec::new())
                }
                Err(err) if core.state.is_active() => {
                    self.set_state(&mut core, JobState::Cancelling);
                    core.cause = Some(err.clone());
                    (
                        err.is_failure(),
                        core.children.clone(),
                        std::mem::take(&mut core.cancel_wakers),
                    )
                }
                _ => (false, Vec::new(), Vec::new()),
            }
        };

        for waker in wakers {
            waker.wake();
        }
        for child in children {
            child.cancel_with(TaskError::Cancelled(CancelReason::ParentCancelled));
        }

        let escalation = match outcome {
            Err(err) if newly_failed => {
                kdebug!("{:?} failed: {}", self.inner.id, err);
                self.escalate(err)
            }
            // Cancellations and failures raised while already cancelling
            _ => Escalation::Handled,
        };
        self.try_finalize();
        escalation != Escalation::Report
    }

    /// Hand a failure this job took to its parent
    fn escalate(&self, err: &TaskError) -> Escalation {
        match self.notify_parent(err) {
            Escalation::Unclaimed if self.inner.reports => Escalation::Report,
            other => other,
        }
    }

    fn notify_parent(&self, err: &TaskError) -> Escalation {
        if self.inner.rethrows {
            return Escalation::Handled;
        }
        match self.parent() {
            Some(parent) => parent.child_failed(err),
            None => Escalation::Unclaimed,
        }
    }

    /// A child failed; takes the failure unless this is a supervisor
    fn child_failed(&self, err: &TaskError) -> Escalation {
        if self.inner.kind == JobKind::Supervisor {
            return Escalation::Unclaimed;
        }
        let upgraded = {
            let mut core = self.inner.core.lock();
            match core.state {
                JobState::Cancelling => match &core.cause {
                    Some(cause) if cause.is_failure() => return Escalation::Handled,
                    // Cancelled on request: the failure becomes the cause
                    _ => {
                        core.cause = Some(err.clone());
                        true
                    }
                },
                state if state.is_terminal() => return Escalation::Unclaimed,
                _ => false,
            }
        };
        if !upgraded && !self.cancel_with(err.clone()) {
            // Lost a race with a concurrent cancel; the other path decides
            return Escalation::Handled;
        }
        self.escalate(err)
    }

    fn child_terminal(&self, id: JobId) {
        self.inner.core.lock().children.retain(|c| c.id() != id);
        self.try_finalize();
    }

    fn try_finalize(&self) {
        let (handlers, wakers, cause, parent, state) = {
            let mut core = self.inner.core.lock();
            if core.state.is_terminal() || !core.body_done || !core.children.is_empty() {
                return;
            }
            let state = if core.state.is_cancelled() {
                JobState::Cancelled
            } else {
                JobState::Completed
            };
            self.set_state(&mut core, state);
            core.cancel_wakers.clear();
            (
                std::mem::take(&mut core.handlers),
                std::mem::take(&mut core.join_wakers),
                core.cause.clone(),
                core.parent.take(),
                state,
            )
        };
        kdebug!("{:?} {}", self.inner.id, state);

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(cause.as_ref()))).is_err() {
                kerror!("completion handler of {:?} panicked", self.inner.id);
            }
        }
        for waker in wakers {
            waker.wake();
        }
        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            Job { inner: parent }.child_terminal(self.inner.id);
        }
    }

    /// Run `handler` once this job is terminal (immediately if it already is)
    ///
    /// The handler receives the cancellation cause, `None` on normal
    /// completion. Handlers run in registration order.
    pub fn invoke_on_completion<F>(&self, handler: F)
    where
        F: FnOnce(Option<&TaskError>) + Send + 'static,
    {
        let cause = {
            let mut core = self.inner.core.lock();
            if !core.state.is_terminal() {
                core.handlers.push(Box::new(handler));
                return;
            }
            core.cause.clone()
        };
        handler(cause.as_ref());
    }

    /// The error a suspended body sees once this job is cancelling
    pub fn cancel_error(&self) -> Option<TaskError> {
        if !self.is_cancelled() {
            return None;
        }
        Some(cancel_error_of(&self.inner.core.lock()))
    }

    /// Cancellation check that also arms `cx` to be woken on cancel
    pub(crate) fn poll_cancelled(&self, cx: &Context<'_>) -> Option<TaskError> {
        let mut core = self.inner.core.lock();
        if core.state.is_cancelled() {
            return Some(cancel_error_of(&core));
        }
        if !core.state.is_terminal() {
            push_waker(&mut core.cancel_wakers, cx.waker());
        }
        None
    }

    /// Wake `waker` when this job starts cancelling
    ///
    /// Returns `false` (and keeps nothing) if it already is.
    pub(crate) fn register_cancel_waker(&self, waker: &Waker) -> bool {
        let mut core = self.inner.core.lock();
        if core.state.is_cancelled() {
            return false;
        }
        if !core.state.is_terminal() {
            push_waker(&mut core.cancel_wakers, waker);
        }
        true
    }

    /// The error an awaiter of a terminal job sees: the failure or the
    /// cancellation, `None` when the job completed
    pub(crate) fn completion_error(&self) -> Option<TaskError> {
        let core = self.inner.core.lock();
        match core.state {
            JobState::Cancelled => Some(
                core.cause
                    .clone()
                    .unwrap_or(TaskError::Cancelled(CancelReason::Requested)),
            ),
            _ => None,
        }
    }

    /// Wait for the terminal state without observing the caller's cancellation
    pub fn terminated(&self) -> Terminated {
        Terminated { job: self.clone() }
    }

    /// Suspend until this job is terminal
    ///
    /// Never rethrows the job's failure; the only error is the caller's own
    /// cancellation.
    pub async fn join(&self) -> TaskResult<()> {
        Cancellable::new(self.terminated()).await
    }
}

fn cancel_error_of(core: &Core) -> TaskError {
    match &core.cause {
        Some(TaskError::Cancelled(reason)) => TaskError::Cancelled(*reason),
        Some(_) => TaskError::Cancelled(CancelReason::ChildFailed),
        None => TaskError::Cancelled(CancelReason::Requested),
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Future resolving when a job reaches a terminal state
pub struct Terminated {
    job: Job,
}

impl Future for Terminated {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut core = self.job.inner.core.lock();
        if core.state.is_terminal() {
            return Poll::Ready(());
        }
        push_waker(&mut core.join_wakers, cx.waker());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::Mutex as StdMutex;

    fn log_completion(job: &Job, log: &Arc<StdMutex<Vec<String>>>, name: &str) {
        let log = Arc::clone(log);
        let name = name.to_string();
        job.invoke_on_completion(move |cause| {
            let what = match cause {
                None => "completed".to_string(),
                Some(e) => format!("cancelled: {}", e),
            };
            log.lock().unwrap().push(format!("{} {}", name, what));
        });
    }

    #[test]
    fn test_parent_completes_only_after_children() {
        let root = Job::new();
        let a = root.task_child().unwrap();
        let b = a.task_child().unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        log_completion(&root, &log, "root");
        log_completion(&a, &log, "a");
        log_completion(&b, &log, "b");

        assert!(root.complete());
        assert!(a.finish_body(Ok(())));
        assert_eq!(root.state(), JobState::Completing);
        assert_eq!(a.state(), JobState::Completing);
        assert_eq!(root.children().len(), 1);

        assert!(b.finish_body(Ok(())));
        assert!(root.is_completed());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["b completed", "a completed", "root completed"]
        );
        assert!(root.children().is_empty());
        assert!(b.parent().is_none());
    }

    #[test]
    fn test_cancel_reaches_descendants_first() {
        let root = Job::new();
        let a = root.task_child().unwrap();
        let a1 = a.task_child().unwrap();
        let a2 = a.child().unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for (job, name) in [(&root, "root"), (&a, "a"), (&a1, "a1"), (&a2, "a2")] {
            log_completion(job, &log, name);
        }

        assert!(root.cancel());
        assert!(!root.cancel());
        // Bodies still running: nothing is terminal yet, everything is cancelling
        for job in [&root, &a, &a1] {
            assert_eq!(job.state(), JobState::Cancelling);
        }
        assert_eq!(a2.state(), JobState::Cancelled);
        assert_eq!(
            a1.cancel_error().unwrap().cancel_reason(),
            Some(CancelReason::ParentCancelled)
        );

        let err = a1.cancel_error().unwrap();
        a1.finish_body(Err(&err));
        a.finish_body(Err(&err));
        assert_eq!(root.state(), JobState::Cancelled);
        let log = log.lock().unwrap();
        assert_eq!(log.last().unwrap(), "root cancelled: task cancelled: cancel requested");
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_plain_parent_fails_together() {
        let root = Job::new();
        let a = root.task_child().unwrap();
        let b = root.task_child().unwrap();

        let handled = a.finish_body(Err(&TaskError::msg("boom")));
        // No ancestor rethrows: the failing task reports
        assert!(!handled);
        assert!(root.is_cancelled());
        assert_eq!(
            b.cancel_error().unwrap().cancel_reason(),
            Some(CancelReason::ParentCancelled)
        );
        assert_eq!(
            root.cancel_error().unwrap().cancel_reason(),
            Some(CancelReason::ChildFailed)
        );
        assert!(matches!(root.cancellation_cause(), Some(TaskError::Failed(_))));

        // A secondary failure is not reported again
        assert!(b.finish_body(Err(&TaskError::msg("late"))));
        assert_eq!(root.state(), JobState::Cancelled);
        assert_eq!(root.cancellation_cause().unwrap().to_string(), "task failed: boom");
    }

    #[test]
    fn test_deferred_failure_reported_once_it_escalates_into_launch() {
        // Directly under a plain root the awaiter owns it
        let root = Job::new();
        let d = root.deferred_child().unwrap();
        assert!(d.finish_body(Err(&TaskError::msg("owned"))));
        assert!(root.is_cancelled());

        // Under a launched task it climbs past the awaiter
        let root = Job::new();
        let launched = root.task_child().unwrap();
        let d = launched.deferred_child().unwrap();
        assert!(!d.finish_body(Err(&TaskError::msg("escaped"))));
        assert!(launched.is_cancelled());
        assert!(root.is_cancelled());

        // Contained by a rethrowing job in between
        let root = Job::new();
        let launched = root.task_child().unwrap();
        let scoped = launched.scoped_child(JobKind::Plain).unwrap();
        let d = scoped.deferred_child().unwrap();
        assert!(d.finish_body(Err(&TaskError::msg("contained"))));
        assert!(launched.is_active());
    }

    #[test]
    fn test_supervisor_isolates_failure() {
        let root = Job::supervisor();
        let a = root.task_child().unwrap();
        let b = root.task_child().unwrap();

        assert!(!a.finish_body(Err(&TaskError::msg("boom"))));
        assert_eq!(a.state(), JobState::Cancelled);
        assert!(root.is_active());
        assert!(b.is_active());
        b.finish_body(Ok(()));
        assert!(b.is_completed());
    }

    #[test]
    fn test_rethrowing_job_takes_failure() {
        let root = Job::new();
        let scoped = root.scoped_child(JobKind::Plain).unwrap();
        let child = scoped.task_child().unwrap();
        assert!(child.finish_body(Err(&TaskError::msg("inner"))));
        assert!(scoped.is_cancelled());
        // The failure stops at the scoped job
        assert!(root.is_active());
    }

    #[test]
    fn test_no_attach_to_inactive_job() {
        let root = Job::new();
        root.cancel();
        assert!(matches!(
            root.child(),
            Err(TaskError::Contract(ContractViolation::AttachToInactiveJob))
        ));
        let done = Job::new();
        done.complete();
        assert!(done.is_completed());
        assert!(done.task_child().is_err());
    }

    #[test]
    fn test_handler_on_terminal_job_runs_immediately() {
        let job = Job::new();
        job.complete();
        let hit = Arc::new(StdMutex::new(false));
        let h = Arc::clone(&hit);
        job.invoke_on_completion(move |cause| *h.lock().unwrap() = cause.is_none());
        assert!(*hit.lock().unwrap());
    }

    #[test]
    fn test_join_waits_for_terminal_state() {
        let job = Job::new();
        let child = job.task_child().unwrap();
        job.complete();
        let j = job.clone();
        let waiter = std::thread::spawn(move || block_on(j.join()));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!job.is_terminal());
        child.finish_body(Ok(()));
        assert!(waiter.join().unwrap().is_ok());
        assert!(job.is_completed());
    }
}
