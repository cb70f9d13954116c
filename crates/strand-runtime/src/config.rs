//! Runtime configuration
//!
//! Library defaults with environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods (programmatic)
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .core_workers(4)
//!     .io_parallelism(128);
//! config.validate()?;
//! ```

use std::time::Duration;

use strand_core::env::{env_get, env_get_bool, env_get_ms};
use strand_core::error::ConfigError;

/// Library defaults
pub mod defaults {
    /// Hard ceiling on pool threads
    pub const MAX_POOL_THREADS: usize = 1024;
    pub const IO_PARALLELISM: usize = 64;
    pub const IDLE_SPINS: u32 = 10;
    pub const PARK_TIMEOUT_MS: u64 = 100;
    pub const KEEP_ALIVE_MS: u64 = 5000;
    pub const TIMER_POLL_MS: u64 = 1;
    pub const DEBUG_LOGGING: bool = cfg!(feature = "debug-logging");

    /// Number of CPUs visible to the process
    pub fn num_cpus() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Pool threads started eagerly and never retired
    pub core_workers: usize,
    /// Upper bound on pool threads (grown on demand)
    pub max_workers: usize,
    /// Concurrency limit of the default (CPU-bound) dispatcher
    pub cpu_parallelism: usize,
    /// Concurrency limit of the IO (blocking) dispatcher
    pub io_parallelism: usize,
    /// Spins before a worker parks
    pub idle_spins: u32,
    /// Worker park timeout
    pub park_timeout: Duration,
    /// Idle time after which a non-core worker exits
    pub keep_alive: Duration,
    /// Upper bound on the timer thread sleep
    pub timer_poll_interval: Duration,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `STRAND_CORE_WORKERS` - Eagerly started pool threads
    /// - `STRAND_MAX_WORKERS` - Pool thread ceiling
    /// - `STRAND_CPU_PARALLELISM` - Default dispatcher limit
    /// - `STRAND_IO_PARALLELISM` - IO dispatcher limit
    /// - `STRAND_IDLE_SPINS` - Spins before parking
    /// - `STRAND_PARK_TIMEOUT_MS` - Park timeout in milliseconds
    /// - `STRAND_KEEP_ALIVE_MS` - Idle retirement of non-core workers
    /// - `STRAND_TIMER_POLL_MS` - Timer thread poll ceiling
    /// - `STRAND_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        let base = Self::new();
        let io_parallelism = env_get("STRAND_IO_PARALLELISM", base.io_parallelism);
        let cpu_parallelism = env_get("STRAND_CPU_PARALLELISM", base.cpu_parallelism);
        Self {
            core_workers: env_get("STRAND_CORE_WORKERS", base.core_workers),
            max_workers: env_get(
                "STRAND_MAX_WORKERS",
                cpu_parallelism.max(io_parallelism),
            ),
            cpu_parallelism,
            io_parallelism,
            idle_spins: env_get("STRAND_IDLE_SPINS", base.idle_spins),
            park_timeout: env_get_ms("STRAND_PARK_TIMEOUT_MS", defaults::PARK_TIMEOUT_MS),
            keep_alive: env_get_ms("STRAND_KEEP_ALIVE_MS", defaults::KEEP_ALIVE_MS),
            timer_poll_interval: env_get_ms("STRAND_TIMER_POLL_MS", defaults::TIMER_POLL_MS),
            debug_logging: env_get_bool("STRAND_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Create config with library defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        let cpus = defaults::num_cpus();
        Self {
            core_workers: cpus,
            max_workers: cpus.max(defaults::IO_PARALLELISM),
            cpu_parallelism: cpus,
            io_parallelism: defaults::IO_PARALLELISM,
            idle_spins: defaults::IDLE_SPINS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            keep_alive: Duration::from_millis(defaults::KEEP_ALIVE_MS),
            timer_poll_interval: Duration::from_millis(defaults::TIMER_POLL_MS),
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn core_workers(mut self, n: usize) -> Self {
        self.core_workers = n;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn cpu_parallelism(mut self, n: usize) -> Self {
        self.cpu_parallelism = n;
        self
    }

    pub fn io_parallelism(mut self, n: usize) -> Self {
        self.io_parallelism = n;
        self
    }

    pub fn idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn keep_alive(mut self, d: Duration) -> Self {
        self.keep_alive = d;
        self
    }

    pub fn timer_poll_interval(mut self, d: Duration) -> Self {
        self.timer_poll_interval = d;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue("max_workers must be > 0"));
        }
        if self.max_workers > defaults::MAX_POOL_THREADS {
            return Err(ConfigError::InvalidValue("max_workers must be <= 1024"));
        }
        if self.core_workers > self.max_workers {
            return Err(ConfigError::InvalidValue("core_workers must be <= max_workers"));
        }
        if self.cpu_parallelism == 0 {
            return Err(ConfigError::InvalidValue("cpu_parallelism must be > 0"));
        }
        if self.io_parallelism == 0 {
            return Err(ConfigError::InvalidValue("io_parallelism must be > 0"));
        }
        if self.timer_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue("timer_poll_interval must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("strand configuration:");
        eprintln!("  core_workers:         {}", self.core_workers);
        eprintln!("  max_workers:          {}", self.max_workers);
        eprintln!("  cpu_parallelism:      {}", self.cpu_parallelism);
        eprintln!("  io_parallelism:       {}", self.io_parallelism);
        eprintln!("  idle_spins:           {}", self.idle_spins);
        eprintln!("  park_timeout:         {:?}", self.park_timeout);
        eprintln!("  keep_alive:           {:?}", self.keep_alive);
        eprintln!("  timer_poll_interval:  {:?}", self.timer_poll_interval);
        eprintln!("  debug_logging:        {}", self.debug_logging);
    }
}
