//! Raw worker-pool dispatcher

use strand_core::ktrace;

use super::{Dispatcher, Runnable};
use crate::worker::WorkerPool;

/// Submits straight to a shared pool with no concurrency limit of its own
///
/// Usually wrapped in a [`LimitedDispatcher`](super::LimitedDispatcher).
#[derive(Clone)]
pub struct PoolDispatcher {
    pool: WorkerPool,
    name: String,
}

impl PoolDispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        let name = pool.name().to_string();
        Self { pool, name }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

impl Dispatcher for PoolDispatcher {
    fn dispatch(&self, runnable: Runnable) {
        ktrace!("dispatch to pool {}", self.name);
        self.pool.submit(runnable);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
