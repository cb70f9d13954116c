//! Dispatchers
//!
//! A dispatcher decides which execution context runs a ready task. Every
//! resumption goes through [`resume_on`]: when the dispatcher reports that
//! the caller is already on the right context, the runnable executes inline
//! (through the thread's inline loop) instead of being handed off.
//!
//! # Variants
//! - [`ConfinedDispatcher`] - serializes onto one [`HostQueue`]; `.immediate()`
//!   skips the hand-off when already on that queue
//! - [`PoolDispatcher`] - raw submission to a shared [`WorkerPool`](crate::worker::WorkerPool)
//! - [`LimitedDispatcher`] - bounds the concurrently executing runnables of
//!   any base dispatcher
//! - [`Unconfined`] - runs wherever the resume happens (testing only)

mod confined;
mod event_loop;
mod limited;
mod pool;
mod registry;
mod unconfined;

pub use confined::{ConfinedDispatcher, HostQueue};
pub use event_loop::EventLoop;
pub use limited::LimitedDispatcher;
pub use pool::PoolDispatcher;
pub use registry::{Dispatchers, DispatchersBuilder};
pub use unconfined::{run_inline, Unconfined};

use std::fmt;
use std::sync::Arc;

/// A unit of work handed to a dispatcher
pub struct Runnable {
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl Runnable {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Runnable { f: Box::new(f) }
    }

    #[inline]
    pub fn run(self) {
        (self.f)()
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Runnable")
    }
}

/// Execution-context policy for ready tasks
pub trait Dispatcher: Send + Sync + 'static {
    /// Hand a runnable to this dispatcher's execution context
    fn dispatch(&self, runnable: Runnable);

    /// Whether the caller must hand off instead of running inline
    fn is_dispatch_needed(&self) -> bool {
        true
    }

    fn name(&self) -> &str;
}

pub type DispatcherRef = Arc<dyn Dispatcher>;

/// Run `runnable` on `dispatcher`, inline when no hand-off is needed
pub fn resume_on(dispatcher: &dyn Dispatcher, runnable: Runnable) {
    if dispatcher.is_dispatch_needed() {
        dispatcher.dispatch(runnable);
    } else {
        run_inline(runnable);
    }
}

/// A view of `base` that runs at most `parallelism` runnables at once
pub fn limited_parallelism(base: DispatcherRef, parallelism: usize) -> DispatcherRef {
    Arc::new(LimitedDispatcher::new(base, parallelism))
}

impl fmt::Debug for dyn Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dispatcher({})", self.name())
    }
}
