//! Dispatcher registry
//!
//! The well-known dispatchers (default, IO, unconfined, main) are built
//! explicitly and passed around, so tests can swap any of them for a
//! deterministic one.

use std::sync::Arc;

use strand_core::error::{ContractViolation, TaskError, TaskResult};

use super::{
    ConfinedDispatcher, DispatcherRef, HostQueue, LimitedDispatcher, PoolDispatcher, Unconfined,
};
use crate::config::RuntimeConfig;
use crate::worker::{PoolConfig, WorkerPool};

/// The dispatchers a runtime hands out
#[derive(Clone)]
pub struct Dispatchers {
    default: DispatcherRef,
    io: DispatcherRef,
    unconfined: DispatcherRef,
    main: Option<ConfinedDispatcher>,
    pool: Option<WorkerPool>,
}

impl Dispatchers {
    pub fn builder() -> DispatchersBuilder {
        DispatchersBuilder::new()
    }

    /// CPU-bound work; limited to `cpu_parallelism` on the shared pool
    #[allow(clippy::should_implement_trait)]
    pub fn default(&self) -> DispatcherRef {
        Arc::clone(&self.default)
    }

    /// Blocking work; limited to `io_parallelism` on the same pool
    pub fn io(&self) -> DispatcherRef {
        Arc::clone(&self.io)
    }

    pub fn unconfined(&self) -> DispatcherRef {
        Arc::clone(&self.unconfined)
    }

    /// The host main queue, if one was installed
    pub fn main(&self) -> TaskResult<DispatcherRef> {
        match &self.main {
            Some(main) => Ok(Arc::new(main.clone())),
            None => Err(TaskError::Contract(ContractViolation::MainDispatcherMissing)),
        }
    }

    /// Main queue variant that skips the hand-off when already on it
    pub fn main_immediate(&self) -> TaskResult<DispatcherRef> {
        match &self.main {
            Some(main) => Ok(Arc::new(main.immediate())),
            None => Err(TaskError::Contract(ContractViolation::MainDispatcherMissing)),
        }
    }

    /// The pool behind `default` and `io`, when the registry built one
    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }
}

/// Builder for [`Dispatchers`]
pub struct DispatchersBuilder {
    config: RuntimeConfig,
    pool: Option<WorkerPool>,
    main: Option<Arc<dyn HostQueue>>,
    default: Option<DispatcherRef>,
    io: Option<DispatcherRef>,
}

impl DispatchersBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::new(),
            pool: None,
            main: None,
            default: None,
            io: None,
        }
    }

    /// Sizing for the pool and the limited views
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing pool instead of starting one
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn cpu_parallelism(mut self, n: usize) -> Self {
        self.config.cpu_parallelism = n;
        self
    }

    pub fn io_parallelism(mut self, n: usize) -> Self {
        self.config.io_parallelism = n;
        self
    }

    /// Install a host main queue
    pub fn main_queue(mut self, queue: Arc<dyn HostQueue>) -> Self {
        self.main = Some(queue);
        self
    }

    /// Replace the default dispatcher outright
    pub fn default_dispatcher(mut self, dispatcher: DispatcherRef) -> Self {
        self.default = Some(dispatcher);
        self
    }

    /// Replace the IO dispatcher outright
    pub fn io_dispatcher(mut self, dispatcher: DispatcherRef) -> Self {
        self.io = Some(dispatcher);
        self
    }

    /// Build the registry, starting a pool only if some view needs one
    pub fn build(self) -> Dispatchers {
        let needs_pool = self.default.is_none() || self.io.is_none();
        let pool = match self.pool {
            Some(pool) => Some(pool),
            None if needs_pool => Some(WorkerPool::new("strand", PoolConfig::from(&self.config))),
            None => None,
        };
        let base: Option<DispatcherRef> = pool
            .as_ref()
            .map(|p| Arc::new(PoolDispatcher::new(p.clone())) as DispatcherRef);

        let limited = |name: &str, limit: usize| -> Option<DispatcherRef> {
            base.as_ref().map(|b| {
                Arc::new(LimitedDispatcher::with_name(Arc::clone(b), limit, name)) as DispatcherRef
            })
        };

        let default = self
            .default
            .or_else(|| limited("default", self.config.cpu_parallelism))
            .unwrap_or_else(|| Arc::new(Unconfined));
        let io = self
            .io
            .or_else(|| limited("io", self.config.io_parallelism))
            .unwrap_or_else(|| Arc::new(Unconfined));

        Dispatchers {
            default,
            io,
            unconfined: Arc::new(Unconfined),
            main: self.main.map(|q| ConfinedDispatcher::new(q, "main")),
            pool,
        }
    }
}

impl Default for DispatchersBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, EventLoop};

    #[test]
    fn test_main_missing_is_contract_violation() {
        let event_loop: Arc<dyn HostQueue> = Arc::new(EventLoop::new());
        let d = Dispatchers::builder()
            .default_dispatcher(Arc::new(Unconfined))
            .io_dispatcher(Arc::new(Unconfined))
            .build();
        assert!(d.pool().is_none());
        assert!(matches!(
            d.main(),
            Err(TaskError::Contract(ContractViolation::MainDispatcherMissing))
        ));

        let d = Dispatchers::builder()
            .default_dispatcher(Arc::new(Unconfined))
            .io_dispatcher(Arc::new(Unconfined))
            .main_queue(event_loop)
            .build();
        let main = d.main().unwrap();
        assert_eq!(main.name(), "main");
        let imm = d.main_immediate().unwrap();
        assert_eq!(imm.name(), "main.immediate");
        assert!(!imm.is_dispatch_needed());
    }

    #[test]
    fn test_pool_views_named_and_shared() {
        let config = RuntimeConfig::new().core_workers(1).max_workers(4);
        let d = Dispatchers::builder()
            .config(config)
            .cpu_parallelism(2)
            .io_parallelism(3)
            .build();
        assert_eq!(d.default().name(), "default");
        assert_eq!(d.io().name(), "io");
        assert_eq!(d.unconfined().name(), "unconfined");
        let pool = d.pool().unwrap();
        assert_eq!(pool.max_workers(), 4);
        pool.shutdown();
    }
}
