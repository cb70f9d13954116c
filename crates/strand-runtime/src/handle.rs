//! Runtime handle
//!
//! Everything a task needs from its runtime: the dispatcher registry, the
//! host clock and the error reporter. Cheap to clone.

use std::fmt;
use std::sync::Arc;

use strand_core::error::{ContractViolation, TaskResult};
use strand_core::JobKind;

use crate::context;
use crate::dispatcher::Dispatchers;
use crate::job::Job;
use crate::reporter::{ErrorReporter, LogReporter};
use crate::scope::Scope;
use crate::timer::HostClock;

struct HandleInner {
    dispatchers: Dispatchers,
    clock: Arc<dyn HostClock>,
    reporter: Arc<dyn ErrorReporter>,
}

#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<HandleInner>,
}

impl RuntimeHandle {
    pub fn new(
        dispatchers: Dispatchers,
        clock: Arc<dyn HostClock>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                dispatchers,
                clock,
                reporter,
            }),
        }
    }

    /// Handle with the logging reporter
    pub fn with_clock(dispatchers: Dispatchers, clock: Arc<dyn HostClock>) -> Self {
        Self::new(dispatchers, clock, Arc::new(LogReporter))
    }

    /// Handle of the running task
    pub fn current() -> TaskResult<RuntimeHandle> {
        context::current()
            .map(|ctx| ctx.handle)
            .ok_or_else(|| ContractViolation::NoTaskContext.into())
    }

    pub fn dispatchers(&self) -> &Dispatchers {
        &self.inner.dispatchers
    }

    pub fn clock(&self) -> &Arc<dyn HostClock> {
        &self.inner.clock
    }

    pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.inner.reporter
    }

    /// New root scope on the default dispatcher
    pub fn scope(&self) -> Scope {
        self.root_scope(JobKind::Plain)
    }

    /// New root scope whose children fail independently
    pub fn supervisor_scope(&self) -> Scope {
        self.root_scope(JobKind::Supervisor)
    }

    fn root_scope(&self, kind: JobKind) -> Scope {
        let job = match kind {
            JobKind::Plain => Job::new(),
            JobKind::Supervisor => Job::supervisor(),
        };
        Scope::new(self, job, self.inner.dispatchers.default())
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("default", &self.inner.dispatchers.default().name())
            .field("io", &self.inner.dispatchers.io().name())
            .finish()
    }
}
