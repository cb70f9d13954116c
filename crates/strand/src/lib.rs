//! # strand - Structured-concurrency runtime
//!
//! Tasks are ordinary Rust futures (the compiler builds their label/frame
//! state machine). Every task belongs to a job in a tree: a parent job
//! completes only after all of its children, cancelling a parent cancels
//! the whole subtree, and a failure cancels the siblings unless a
//! supervisor sits in between.
//!
//! ## Features
//!
//! - **Dispatchers**: bounded worker pool with per-dispatcher limits
//!   (`default`, `io`), confined host queue (`main`), unconfined
//! - **Job tree**: plain and supervisor jobs, cooperative cancellation,
//!   `join` / `Deferred` await
//! - **Timers**: `delay`, `with_timeout`, `with_timeout_or_none`
//! - **Sync**: FIFO suspending `Mutex`
//! - **Streams**: cold `Sequence`, hot `StateCell`, hot `Broadcast`
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use strand::{delay, Runtime};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::new()?;
//!     let total = runtime.block_on(|scope| async move {
//!         let a = scope.spawn(|_| async {
//!             delay(Duration::from_millis(10)).await?;
//!             Ok(20)
//!         })?;
//!         let b = scope.spawn(|_| async { Ok(22) })?;
//!         Ok(a.await? + b.await?)
//!     })?;
//!     assert_eq!(total, 42);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │     Scope::launch / spawn, scoped, with_timeout, streams    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Job tree + Tasks                            │
//! │    state machine, cancellation, failure propagation         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  default  │      │    io     │      │   Timer   │
//!    │ (limited) │      │ (limited) │      │   Thread  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │
//!          └─────────┬─────────┘
//!                    ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │          Worker pool (futex parking, elastic)           │
//!    └─────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Re-export core types
pub use strand_core::{
    CancelReason, ConfigError, Continuation, ContractViolation, Failure, Frame, JobId, JobKind,
    JobState, Machine, Resume, StateMachine, Step, Suspended, TaskError, TaskId, TaskResult,
    TryEmitError, TryLockError,
};

// Re-export kprint macros for debug logging
pub use strand_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use strand_core::kprint::{
    init as init_logging, set_flush_enabled, set_log_level, set_time_enabled, LogLevel,
};

// Re-export env utilities
pub use strand_core::{env_get, env_get_bool, env_get_ms, env_get_opt};

// Re-export runtime types
pub use strand_runtime::context::{current_job, current_task_id, is_in_task};
pub use strand_runtime::flow::{
    sequence, Broadcast, BroadcastConfig, BroadcastSubscription, Emitter, Overflow, Sequence,
    SequenceStream, StateCell, StateSubscription, WatchHandle,
};
pub use strand_runtime::{
    cancellable, delay, ensure_active, scoped, supervisor_scoped, suspend_cancellable,
    with_dispatcher, with_timeout, with_timeout_or_none, yield_now, Cancellable,
    ConfinedDispatcher, Deferred, Dispatcher, DispatcherRef, Dispatchers, ErrorReporter,
    EventLoop, HostClock, HostQueue, Job, LogReporter, ManualClock, Mutex, MutexGuard,
    RuntimeConfig, RuntimeHandle, Scope, Start, TaskHandle, TimerHandle, TimerService,
    TimerServiceConfig,
};

/// Fail the current task if its job was cancelled
///
/// Place this in CPU-bound loops that have no other suspension point; such
/// a loop cannot be cancelled otherwise.
///
/// ```ignore
/// for chunk in data.chunks(4096) {
///     strand::check_cancellation!();
///     crunch(chunk);
/// }
/// ```
#[macro_export]
macro_rules! check_cancellation {
    () => {
        $crate::ensure_active()?
    };
}

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    reporter: Option<Arc<dyn ErrorReporter>>,
    main_queue: Option<Arc<dyn HostQueue>>,
    clock: Option<Arc<dyn HostClock>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::from_env(),
            reporter: None,
            main_queue: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sink for failures no task awaits (default: `LogReporter`)
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Install the host's main queue behind `Dispatchers::main()`
    pub fn main_queue(mut self, queue: Arc<dyn HostQueue>) -> Self {
        self.main_queue = Some(queue);
        self
    }

    /// Use `clock` instead of starting a timer thread
    pub fn clock(mut self, clock: Arc<dyn HostClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Runtime, ConfigError> {
        self.config.validate()?;
        strand_core::kprint::init();
        if self.config.debug_logging {
            set_log_level(LogLevel::Debug);
        }

        let mut dispatchers = Dispatchers::builder().config(self.config.clone());
        if let Some(queue) = self.main_queue {
            dispatchers = dispatchers.main_queue(queue);
        }
        let dispatchers = dispatchers.build();

        let (clock, timers): (Arc<dyn HostClock>, Option<Arc<TimerService>>) = match self.clock {
            Some(clock) => (clock, None),
            None => {
                let timers = Arc::new(TimerService::start(TimerServiceConfig {
                    max_poll_interval: self.config.timer_poll_interval,
                    ..TimerServiceConfig::default()
                }));
                let clock: Arc<dyn HostClock> = timers.clone();
                (clock, Some(timers))
            }
        };
        let reporter = self.reporter.unwrap_or_else(|| Arc::new(LogReporter));
        let handle = RuntimeHandle::new(dispatchers, clock, reporter);

        kinfo!(
            "runtime started: cpu_parallelism={} io_parallelism={} max_workers={}",
            self.config.cpu_parallelism,
            self.config.io_parallelism,
            self.config.max_workers
        );

        Ok(Runtime {
            handle,
            timers,
            root: Job::supervisor(),
            shut_down: AtomicBool::new(false),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the worker pool and timer thread
///
/// Scopes made through the runtime hang off one supervisor root, so
/// `shutdown` cancels everything still running with
/// `CancelReason::Shutdown`.
pub struct Runtime {
    handle: RuntimeHandle,
    timers: Option<Arc<TimerService>>,
    root: Job,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Runtime with `RuntimeConfig::from_env()`
    pub fn new() -> Result<Self, ConfigError> {
        RuntimeBuilder::new().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    pub fn dispatchers(&self) -> &Dispatchers {
        self.handle.dispatchers()
    }

    /// A plain scope on the default dispatcher
    ///
    /// Fails with `AttachToInactiveJob` after shutdown.
    pub fn scope(&self) -> TaskResult<Scope> {
        let job = self.root.child()?;
        Ok(Scope::new(&self.handle, job, self.dispatchers().default()))
    }

    /// A scope whose children fail independently
    pub fn supervisor_scope(&self) -> TaskResult<Scope> {
        let job = self.root.supervisor_child()?;
        Ok(Scope::new(&self.handle, job, self.dispatchers().default()))
    }

    /// Run `body` as a task on the calling thread and wait for it
    ///
    /// The calling thread drains its own event loop; tasks the body moves
    /// to other dispatchers run there. Returns once the body and everything
    /// it launched in its scope are done.
    pub fn block_on<T, F, Fut>(&self, body: F) -> TaskResult<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let event_loop = Arc::new(EventLoop::new());
        let confined: DispatcherRef =
            Arc::new(ConfinedDispatcher::new(event_loop.clone(), "block_on"));
        let scope = Scope::new(&self.handle, self.root.child()?, confined);

        let deferred = scope.spawn(body)?;
        let waker = Arc::clone(&event_loop);
        deferred.job().invoke_on_completion(move |_| waker.notify());
        event_loop.run_until(|| deferred.job().is_terminal(), None);

        scope.complete();
        let waker = Arc::clone(&event_loop);
        scope.job().invoke_on_completion(move |_| waker.notify());
        event_loop.run_until(|| scope.job().is_terminal(), None);

        match deferred.try_take() {
            Some(result) => result,
            None => Err(TaskError::Contract(ContractViolation::ResultAlreadyTaken)),
        }
    }

    /// Cancel all work and stop the pool and timer thread
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.root
            .cancel_with(TaskError::Cancelled(CancelReason::Shutdown));
        if let Some(pool) = self.dispatchers().pool() {
            pool.shutdown();
        }
        if let Some(timers) = &self.timers {
            timers.shutdown();
        }
        kinfo!("runtime shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn small_runtime() -> Runtime {
        Runtime::builder()
            .config(
                RuntimeConfig::new()
                    .core_workers(2)
                    .max_workers(8)
                    .cpu_parallelism(2)
                    .io_parallelism(4),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_block_on_returns_value() {
        let rt = small_runtime();
        let total = rt
            .block_on(|scope| async move {
                let a = scope.spawn(|_| async {
                    delay(Duration::from_millis(5)).await?;
                    Ok(20)
                })?;
                let b = scope.spawn(|_| async { Ok(22) })?;
                Ok(a.await? + b.await?)
            })
            .unwrap();
        assert_eq!(total, 42);
    }

    #[test]
    fn test_block_on_waits_for_children_on_pool() {
        let rt = small_runtime();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let io = rt.dispatchers().io();
        rt.block_on(move |scope| async move {
            for _ in 0..16 {
                let d = Arc::clone(&d);
                scope.on(io.clone()).launch(move |_| async move {
                    delay(Duration::from_millis(2)).await?;
                    d.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_timeout_end_to_end() {
        let rt = small_runtime();
        let cleaned = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&cleaned);
        let t = Duration::from_millis(20);
        let r = rt.block_on(move |_| async move {
            with_timeout(t, async move {
                struct Cleanup(Arc<AtomicBool>);
                impl Drop for Cleanup {
                    fn drop(&mut self) {
                        self.0.store(true, Ordering::SeqCst);
                    }
                }
                let _cleanup = Cleanup(c);
                delay(t * 2).await?;
                Ok(())
            })
            .await
        });
        assert!(matches!(r, Err(TaskError::Timeout(d)) if d == t));
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_check_cancellation_macro() {
        let rt = small_runtime();
        let r = rt.block_on(|scope| async move {
            let mut spins = 0u64;
            loop {
                check_cancellation!();
                spins += 1;
                if spins == 1_000 {
                    scope.job().cancel();
                }
                if spins > 1_000_000 {
                    return Ok(spins);
                }
            }
        });
        assert!(matches!(
            r,
            Err(TaskError::Cancelled(CancelReason::Requested))
        ));
    }

    #[test]
    fn test_shutdown_cancels_outstanding_work() {
        let rt = small_runtime();
        let scope = rt.supervisor_scope().unwrap();
        let parked = scope
            .launch(|_| async {
                delay(Duration::from_secs(60)).await?;
                Ok(())
            })
            .unwrap();
        rt.shutdown();
        assert!(rt.is_shut_down());
        assert!(matches!(
            rt.scope(),
            Err(TaskError::Contract(ContractViolation::AttachToInactiveJob))
        ));
        assert!(!parked.job().is_active());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let r = Runtime::builder()
            .config(RuntimeConfig::new().cpu_parallelism(0))
            .build();
        assert!(matches!(r, Err(ConfigError::InvalidValue(_))));
    }
}
