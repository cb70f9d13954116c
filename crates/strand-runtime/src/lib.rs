//! # strand-runtime
//!
//! Scheduling and structured-concurrency machinery for strand.
//!
//! This crate provides:
//! - Worker pool with futex parking (condvar fallback off Linux)
//! - Dispatchers: confined (host queue), pool-backed, limited, unconfined
//! - Job tree with fail-together and supervisor semantics
//! - Tasks, scopes, `Deferred` results and cancellable suspension points
//! - Timers (`TimerService` thread or `ManualClock`), `delay`, `with_timeout`
//! - Suspending `Mutex`
//! - Cold `Sequence`, hot `StateCell` and `Broadcast` streams

pub mod config;
pub mod parking;
pub mod ready_queue;
pub mod worker;
pub mod dispatcher;
pub mod timer;
pub mod reporter;
pub mod context;
pub mod handle;
pub mod job;
mod task;
pub mod suspend;
pub mod scope;
pub mod time;
pub mod sync;
pub mod flow;

// Re-exports
pub use config::RuntimeConfig;
pub use worker::{PoolConfig, WorkerPool};
pub use dispatcher::{
    limited_parallelism, resume_on, ConfinedDispatcher, Dispatcher, DispatcherRef, Dispatchers,
    DispatchersBuilder, EventLoop, HostQueue, Runnable, Unconfined,
};
pub use timer::{HostClock, ManualClock, TimerCallback, TimerHandle, TimerService, TimerServiceConfig};
pub use reporter::{ErrorReporter, LogReporter};
pub use handle::RuntimeHandle;
pub use job::Job;
pub use suspend::{cancellable, ensure_active, suspend_cancellable, yield_now, Cancellable};
pub use scope::{scoped, supervisor_scoped, with_dispatcher, Deferred, Scope, Start, TaskHandle};
pub use time::{delay, with_timeout, with_timeout_or_none};
pub use sync::{Mutex, MutexGuard};
pub use flow::{sequence, Broadcast, BroadcastConfig, Overflow, Sequence, StateCell};
