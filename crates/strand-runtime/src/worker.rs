//! Shared worker pool
//!
//! OS threads that run `Runnable`s from a `ReadyQueue`. Dispatchers never
//! own threads: the default and IO dispatchers are limited views over one
//! pool. `core_workers` threads are started eagerly; more are added on
//! demand (up to `max_workers`) when queued work outnumbers idle workers,
//! and those extra threads retire after `keep_alive` without work.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand_core::{kdebug, kerror, kinfo, kprint};

use crate::config::RuntimeConfig;
use crate::dispatcher::Runnable;
use crate::parking::{new_parking, WorkerParking};
use crate::ready_queue::ReadyQueue;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// (pool id, worker index) of the pool worker running on this thread
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Pool sizing and idle behaviour
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub core_workers: usize,
    pub max_workers: usize,
    pub idle_spins: u32,
    pub park_timeout: Duration,
    pub keep_alive: Duration,
}

impl From<&RuntimeConfig> for PoolConfig {
    fn from(c: &RuntimeConfig) -> Self {
        PoolConfig {
            core_workers: c.core_workers,
            max_workers: c.max_workers.max(1),
            idle_spins: c.idle_spins,
            park_timeout: c.park_timeout,
            keep_alive: c.keep_alive,
        }
    }
}

struct PoolInner {
    id: usize,
    name: String,
    config: PoolConfig,
    queue: ReadyQueue,
    parking: Box<dyn WorkerParking>,
    /// Threads alive
    live: AtomicUsize,
    /// Threads not currently running a runnable
    idle: AtomicUsize,
    /// Occupied worker indices
    slots: Mutex<Vec<bool>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// Pool of worker threads shared by the pool-backed dispatchers
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool and start its core workers
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let max = config.max_workers.max(1);
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            queue: ReadyQueue::new(max),
            parking: new_parking(),
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            slots: Mutex::new(vec![false; max]),
            handles: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            config,
        });
        let core = inner.config.core_workers.min(max);
        for _ in 0..core {
            if !PoolInner::spawn_worker(&inner, true) {
                break;
            }
        }
        kinfo!(
            "pool {} started: {} core / {} max workers",
            inner.name,
            core,
            max
        );
        WorkerPool { inner }
    }

    /// Submit a runnable
    pub fn submit(&self, runnable: Runnable) {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            kdebug!("pool {} is shut down, dropping runnable", inner.name);
            return;
        }
        let hint = CURRENT_WORKER
            .with(|c| c.get())
            .filter(|(pool, _)| *pool == inner.id)
            .map(|(_, index)| index);
        inner.queue.push(runnable, hint);
        inner.parking.wake_one();

        // Grow when queued work outnumbers the workers free to take it
        if inner.queue.len() > inner.idle.load(Ordering::SeqCst)
            && inner.live.load(Ordering::SeqCst) < inner.config.max_workers
        {
            PoolInner::spawn_worker(inner, false);
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Threads currently alive
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::Relaxed)
    }

    /// Threads not running anything (hint)
    pub fn idle_workers(&self) -> usize {
        self.inner.idle.load(Ordering::Relaxed)
    }

    pub fn max_workers(&self) -> usize {
        self.inner.config.max_workers
    }

    /// Approximate number of queued runnables
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work, wake every worker and join them
    ///
    /// Runnables still queued are dropped. Called from a pool worker, the
    /// calling thread is not joined.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.parking.wake_all();
        let handles: Vec<_> = self.inner.handles.lock().drain(..).collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
        kinfo!("pool {} stopped", self.inner.name);
    }
}

impl PoolInner {
    fn spawn_worker(self: &Arc<Self>, core: bool) -> bool {
        let index = {
            let mut slots = self.slots.lock();
            if self.live.load(Ordering::SeqCst) >= self.config.max_workers {
                return false;
            }
            match slots.iter().position(|used| !used) {
                Some(i) => {
                    slots[i] = true;
                    i
                }
                None => return false,
            }
        };
        // Counted before the thread starts so concurrent submits see it
        self.live.fetch_add(1, Ordering::SeqCst);
        self.idle.fetch_add(1, Ordering::SeqCst);

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", self.name, index))
            .spawn(move || inner.run_worker(index, core));

        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                kdebug!("pool {} spawned worker {} (core={})", self.name, index, core);
                true
            }
            Err(e) => {
                kerror!("pool {} failed to spawn worker: {}", self.name, e);
                self.idle.fetch_sub(1, Ordering::SeqCst);
                self.live.fetch_sub(1, Ordering::SeqCst);
                self.slots.lock()[index] = false;
                false
            }
        }
    }

    fn run_worker(self: Arc<Self>, index: usize, core: bool) {
        CURRENT_WORKER.with(|c| c.set(Some((self.id, index))));
        kprint::set_worker_id(index as u32);

        let mut spins = 0u32;
        let mut last_work = Instant::now();

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Some(runnable) = self.queue.pop(index) {
                self.idle.fetch_sub(1, Ordering::SeqCst);
                if catch_unwind(AssertUnwindSafe(|| runnable.run())).is_err() {
                    kerror!("runnable panicked on pool {}", self.name);
                }
                self.idle.fetch_add(1, Ordering::SeqCst);
                spins = 0;
                last_work = Instant::now();
                continue;
            }

            if spins < self.config.idle_spins {
                spins += 1;
                std::hint::spin_loop();
                thread::yield_now();
                continue;
            }

            if !core && last_work.elapsed() >= self.config.keep_alive {
                kdebug!("pool {} worker {} retiring", self.name, index);
                break;
            }

            self.parking.park(Some(self.config.park_timeout));
            spins = 0;
        }

        self.idle.fetch_sub(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.slots.lock()[index] = false;
        CURRENT_WORKER.with(|c| c.set(None));
        kprint::clear_worker_id();

        // Work may have arrived between our last pop and leaving the idle set
        if !self.shutdown.load(Ordering::Acquire) && !self.queue.is_empty() {
            PoolInner::spawn_worker(&self, false);
        }
    }
}
