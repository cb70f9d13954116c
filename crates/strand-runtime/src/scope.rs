//! Scopes and launching
//!
//! A [`Scope`] couples a job, a dispatcher and an error handler. Tasks are
//! launched into a scope: each gets a child job of the scope's job and runs
//! on the scope's dispatcher. The body receives its own scope (the task's
//! job, same dispatcher and handler) to launch grandchildren with.
//!
//! ```rust,ignore
//! let scope = handle.scope();
//! let answer = scope.spawn(|_| async { Ok(42) })?;
//! scope.launch(|inner| async move {
//!     inner.launch(|_| async { delay(Duration::from_millis(10)).await })?;
//!     Ok(())
//! })?;
//! assert_eq!(answer.await?, 42);
//! ```

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use strand_core::error::{ContractViolation, TaskError, TaskResult};
use strand_core::{JobKind, JobState, TaskId};

use crate::context;
use crate::dispatcher::DispatcherRef;
use crate::handle::RuntimeHandle;
use crate::job::Job;
use crate::reporter::ErrorReporter;
use crate::suspend::InJob;
use crate::task::{run_body, ResultSlot, Slot, Task};

/// When a launched task first runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Start {
    /// Dispatched immediately
    #[default]
    Default,

    /// Created idle; runs on `start()`, `join()` or await
    Lazy,

    /// First leg runs on the calling thread, up to its first suspension
    Undispatched,
}

/// Job, dispatcher and error handler that tasks are launched into
#[derive(Clone)]
pub struct Scope {
    job: Job,
    dispatcher: DispatcherRef,
    handler: Option<Arc<dyn ErrorReporter>>,
    handle: RuntimeHandle,
}

impl Scope {
    pub fn new(handle: &RuntimeHandle, job: Job, dispatcher: DispatcherRef) -> Scope {
        Scope {
            job,
            dispatcher,
            handler: None,
            handle: handle.clone(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn dispatcher(&self) -> &DispatcherRef {
        &self.dispatcher
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    /// Same job, different dispatcher
    pub fn on(&self, dispatcher: DispatcherRef) -> Scope {
        Scope {
            dispatcher,
            ..self.clone()
        }
    }

    /// Route unhandled failures of tasks launched here to `handler`
    pub fn with_error_handler(self, handler: Arc<dyn ErrorReporter>) -> Scope {
        Scope {
            handler: Some(handler),
            ..self
        }
    }

    fn reporter(&self) -> Arc<dyn ErrorReporter> {
        match &self.handler {
            Some(handler) => Arc::clone(handler),
            None => Arc::clone(self.handle.reporter()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.job.is_active()
    }

    /// Cancel the scope's job and every task launched in it
    pub fn cancel(&self) -> bool {
        self.job.cancel()
    }

    /// Let a root scope finish once its tasks are done
    pub fn complete(&self) -> bool {
        self.job.complete()
    }

    /// Suspend until the scope's job is terminal
    pub async fn join(&self) -> TaskResult<()> {
        self.job.join().await
    }

    /// Child scope with a bodiless plain job
    pub fn child(&self) -> TaskResult<Scope> {
        Ok(Scope {
            job: self.job.child()?,
            ..self.clone()
        })
    }

    /// Child scope whose tasks fail independently
    pub fn supervisor(&self) -> TaskResult<Scope> {
        Ok(Scope {
            job: self.job.supervisor_child()?,
            ..self.clone()
        })
    }

    fn start_task<T, F, Fut>(&self, start: Start, body: F, report: bool) -> TaskResult<(Arc<Task>, ResultSlot<T>)>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let job = if report {
            self.job.task_child()?
        } else {
            self.job.deferred_child()?
        };
        let inner = Scope {
            job: job.clone(),
            ..self.clone()
        };
        let slot: ResultSlot<T> = Arc::new(Mutex::new(Slot::Empty));
        let future = run_body(
            job.clone(),
            body(inner),
            Arc::clone(&slot),
            self.reporter(),
        );
        let task = Task::new(job, Arc::clone(&self.dispatcher), self.handle.clone(), future.boxed());
        task.watch_cancellation();
        match start {
            Start::Default => {
                task.start();
            }
            Start::Lazy => {}
            Start::Undispatched => task.start_undispatched(),
        }
        Ok((task, slot))
    }

    /// Launch a fire-and-forget task
    ///
    /// An unhandled failure is reported to the scope's error handler.
    /// Fails with `AttachToInactiveJob` when the scope is cancelling or done.
    pub fn launch<F, Fut>(&self, body: F) -> TaskResult<TaskHandle>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        self.launch_with(Start::Default, body)
    }

    pub fn launch_with<F, Fut>(&self, start: Start, body: F) -> TaskResult<TaskHandle>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        let (task, _slot) = self.start_task(start, body, true)?;
        Ok(TaskHandle { task })
    }

    /// Launch a task whose result is awaited through the returned `Deferred`
    ///
    /// The failure still cancels a plain parent. The awaiter receives it
    /// and it is not reported, unless it escalates into a launched task.
    pub fn spawn<T, F, Fut>(&self, body: F) -> TaskResult<Deferred<T>>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(Start::Default, body)
    }

    pub fn spawn_with<T, F, Fut>(&self, start: Start, body: F) -> TaskResult<Deferred<T>>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (task, slot) = self.start_task(start, body, false)?;
        Ok(Deferred {
            handle: TaskHandle { task },
            slot,
        })
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("job", &self.job)
            .field("dispatcher", &self.dispatcher.name())
            .finish()
    }
}

/// Handle to a launched task
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<Task>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn job(&self) -> &Job {
        self.task.job()
    }

    pub fn state(&self) -> JobState {
        self.job().state()
    }

    /// Start a lazy task; `false` if it already started
    pub fn start(&self) -> bool {
        self.task.start()
    }

    pub fn cancel(&self) -> bool {
        self.job().cancel()
    }

    pub fn is_active(&self) -> bool {
        self.job().is_active()
    }

    pub fn is_completed(&self) -> bool {
        self.job().is_completed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.job().is_cancelled()
    }

    /// Start if lazy, then suspend until the task's job is terminal
    ///
    /// Does not rethrow the task's failure.
    pub async fn join(&self) -> TaskResult<()> {
        self.start();
        self.job().join().await
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("job", self.job())
            .finish()
    }
}

/// Result-bearing task handle
///
/// Awaiting it starts a lazy task, waits for the task's job and returns the
/// body's value, or rethrows the failure or cancellation that ended the job.
pub struct Deferred<T> {
    handle: TaskHandle,
    slot: ResultSlot<T>,
}

impl<T: Send + 'static> Deferred<T> {
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn job(&self) -> &Job {
        self.handle.job()
    }

    pub fn start(&self) -> bool {
        self.handle.start()
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    pub fn is_completed(&self) -> bool {
        self.handle.is_completed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// The outcome, without suspending, once the job is terminal
    ///
    /// A second take of a completed value is `ResultAlreadyTaken`.
    pub fn try_take(&self) -> Option<TaskResult<T>> {
        if !self.job().is_terminal() {
            return None;
        }
        if let Some(err) = self.job().completion_error() {
            return Some(Err(err));
        }
        let mut slot = self.slot.lock();
        Some(match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => result,
            Slot::Empty | Slot::Taken => Err(ContractViolation::ResultAlreadyTaken.into()),
        })
    }

    /// Suspend until the task is done and take its outcome
    pub async fn wait(&self) -> TaskResult<T> {
        self.handle.join().await?;
        self.try_take()
            .unwrap_or_else(|| Err(ContractViolation::ResultAlreadyTaken.into()))
    }
}

impl<T: Send + 'static> IntoFuture for Deferred<T> {
    type Output = TaskResult<T>;
    type IntoFuture = BoxFuture<'static, TaskResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("task", &self.handle).finish()
    }
}

async fn scoped_in<T, F, Fut>(kind: JobKind, body: F) -> TaskResult<T>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = TaskResult<T>>,
{
    let ctx = context::current().ok_or(TaskError::Contract(ContractViolation::NoTaskContext))?;
    if let Some(err) = ctx.job.cancel_error() {
        return Err(err);
    }
    let job = ctx.job.scoped_child(kind)?;
    let scope = Scope {
        job: job.clone(),
        dispatcher: ctx.dispatcher,
        handler: None,
        handle: ctx.handle,
    };

    let result = match AssertUnwindSafe(InJob::new(job.clone(), body(scope)))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(TaskError::Panicked("scoped block panicked".into())),
    };
    job.finish_body(result.as_ref().map(|_| ()));
    // Children were cancelled if the block failed; wait for them either way
    job.terminated().await;

    match job.completion_error() {
        Some(err) => Err(err),
        None => result,
    }
}

/// Run `body` in a child scope and wait for everything it launched
///
/// The first failure inside cancels the whole block and is returned here
/// instead of propagating to the caller's job.
pub async fn scoped<T, F, Fut>(body: F) -> TaskResult<T>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = TaskResult<T>>,
{
    scoped_in(JobKind::Plain, body).await
}

/// Like [`scoped`], but a failing child does not cancel its siblings
pub async fn supervisor_scoped<T, F, Fut>(body: F) -> TaskResult<T>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = TaskResult<T>>,
{
    scoped_in(JobKind::Supervisor, body).await
}

/// Run `body` on `dispatcher` and return its result to the caller
///
/// The block is a child of the caller's job: cancelling the caller cancels
/// it, and its failure comes back as the return value.
pub async fn with_dispatcher<T, F, Fut>(dispatcher: DispatcherRef, body: F) -> TaskResult<T>
where
    F: FnOnce(Scope) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
    T: Send + 'static,
{
    scoped(move |scope| async move { scope.on(dispatcher).spawn(body)?.await }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestRuntime;
    use crate::time::delay;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use strand_core::error::CancelReason;

    #[test]
    fn test_spawn_and_await() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let d = scope.spawn(|_| async { Ok(21 * 2) }).unwrap();
        let outer = scope.spawn(move |_| async move { d.await }).unwrap();
        rt.run();
        assert_eq!(outer.try_take().unwrap().unwrap(), 42);
        assert!(matches!(
            outer.try_take(),
            Some(Err(TaskError::Contract(ContractViolation::ResultAlreadyTaken)))
        ));
    }

    #[test]
    fn test_supervisor_keeps_sibling_running() {
        let rt = TestRuntime::new();
        let scope = rt.supervisor_scope();
        let a = scope
            .launch(|_| async { Err(TaskError::msg("a failed")) })
            .unwrap();
        let b_done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&b_done);
        let b = scope
            .launch(move |_| async move {
                delay(Duration::from_millis(100)).await?;
                flag.store(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        rt.run();
        assert!(a.is_cancelled());
        assert!(b.is_active());
        assert!(scope.is_active());

        rt.advance(Duration::from_millis(100));
        assert!(b.is_completed());
        assert_eq!(b_done.load(Ordering::SeqCst), 1);
        assert_eq!(rt.reported(), vec!["task failed: a failed".to_string()]);
    }

    #[test]
    fn test_plain_scope_cancels_sibling_on_failure() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let b = scope
            .launch(|_| async {
                delay(Duration::from_millis(100)).await?;
                Ok(())
            })
            .unwrap();
        scope
            .launch(|_| async { Err(TaskError::msg("a failed")) })
            .unwrap();
        rt.run();
        assert_eq!(b.state(), JobState::Cancelled);
        assert_eq!(scope.job().state(), JobState::Cancelled);
        // Only the original failure is reported
        assert_eq!(rt.reported(), vec!["task failed: a failed".to_string()]);
        assert!(matches!(
            scope.launch(|_| async { Ok(()) }),
            Err(TaskError::Contract(ContractViolation::AttachToInactiveJob))
        ));
    }

    #[test]
    fn test_spawn_failure_escalating_through_launch_is_reported() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let sibling = scope
            .launch(|_| async {
                delay(Duration::from_millis(100)).await?;
                Ok(())
            })
            .unwrap();
        let outer = scope
            .launch(|inner| async move {
                let d = inner.spawn(|_| async { Err::<u32, _>(TaskError::msg("boom")) })?;
                d.await?;
                Ok(())
            })
            .unwrap();
        rt.run();
        assert_eq!(sibling.state(), JobState::Cancelled);
        assert_eq!(outer.state(), JobState::Cancelled);
        assert_eq!(scope.job().state(), JobState::Cancelled);
        assert_eq!(rt.reported(), vec!["task failed: boom".to_string()]);
    }

    #[test]
    fn test_spawn_failure_directly_in_scope_left_to_awaiter() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let d = scope
            .spawn(|_| async { Err::<u32, _>(TaskError::msg("mine")) })
            .unwrap();
        rt.run();
        // Fails together with the scope, but the awaiter owns the error
        assert_eq!(scope.job().state(), JobState::Cancelled);
        assert_eq!(d.try_take().unwrap().unwrap_err().to_string(), "task failed: mine");
        assert!(rt.reported().is_empty());
    }

    #[test]
    fn test_deferred_failure_rethrown_not_reported() {
        let rt = TestRuntime::new();
        let scope = rt.supervisor_scope();
        let d = scope
            .spawn(|_| async { Err::<u32, _>(TaskError::msg("nope")) })
            .unwrap();
        rt.run();
        assert_eq!(d.try_take().unwrap().unwrap_err().to_string(), "task failed: nope");
        assert!(rt.reported().is_empty());
    }

    #[test]
    fn test_lazy_starts_on_join() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let lazy = scope
            .launch_with(Start::Lazy, move |_| async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        rt.run();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        scope
            .launch(move |_| async move { lazy.join().await })
            .unwrap();
        rt.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undispatched_error_is_immediate() {
        let rt = TestRuntime::new();
        let scope = rt.supervisor_scope();
        let d = scope
            .spawn_with(Start::Undispatched, |_| async {
                Err::<(), _>(TaskError::msg("early"))
            })
            .unwrap();
        // Nothing was dispatched; the outcome is already there
        assert!(matches!(d.try_take(), Some(Err(TaskError::Failed(_)))));
        assert_eq!(rt.run(), 0);
    }

    #[test]
    fn test_scope_completes_after_children() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        scope
            .launch(|inner| async move {
                inner.launch(|_| async {
                    delay(Duration::from_millis(50)).await?;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        scope.complete();
        rt.run();
        assert_eq!(scope.job().state(), JobState::Completing);
        rt.advance(Duration::from_millis(50));
        assert_eq!(scope.job().state(), JobState::Completed);
    }

    #[test]
    fn test_scoped_rethrows_child_failure() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let sibling_cancelled = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&sibling_cancelled);
        let d = scope
            .spawn(move |_| async move {
                let r: TaskResult<()> = scoped(|s| async move {
                    s.launch(move |_| async move {
                        let r = delay(Duration::from_millis(100)).await;
                        if let Err(TaskError::Cancelled(CancelReason::ParentCancelled)) = r {
                            flag.store(1, Ordering::SeqCst);
                        }
                        r
                    })?;
                    s.launch(|_| async { Err(TaskError::msg("inner")) })?;
                    Ok(())
                })
                .await;
                Ok(r.unwrap_err().to_string())
            })
            .unwrap();
        rt.run();
        assert_eq!(d.try_take().unwrap().unwrap(), "task failed: inner");
        assert_eq!(sibling_cancelled.load(Ordering::SeqCst), 1);
        // Contained by the scoped block
        assert!(scope.is_active());
        assert!(rt.reported().is_empty());
    }

    #[test]
    fn test_scoped_outside_task_is_contract_violation() {
        let r = futures::executor::block_on(scoped(|_| async { Ok(()) }));
        assert!(matches!(
            r,
            Err(TaskError::Contract(ContractViolation::NoTaskContext))
        ));
    }

    #[test]
    fn test_with_dispatcher_returns_result() {
        let rt = TestRuntime::new();
        let scope = rt.scope();
        let io = rt.handle.dispatchers().io();
        let d = scope
            .spawn(move |_| async move {
                with_dispatcher(io, |_| async {
                    let name = context::current().map(|c| c.dispatcher().name().to_string());
                    Ok(name.unwrap_or_default())
                })
                .await
            })
            .unwrap();
        rt.run();
        assert_eq!(d.try_take().unwrap().unwrap(), "test-io");
    }
}
