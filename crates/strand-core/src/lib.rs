//! # strand-core
//!
//! Core types for the strand structured-concurrency runtime.
//!
//! This crate is platform-agnostic and contains no scheduling code.
//! Workers, dispatchers, jobs and streams live in `strand-runtime`.
//!
//! ## Modules
//!
//! - `id` - Job and task identifiers
//! - `state` - Job lifecycle states and supervision kind
//! - `error` - Task error taxonomy
//! - `continuation` - One-shot resume handles
//! - `frame` - Explicit label/frame state machines
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod continuation;
pub mod frame;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{JobId, TaskId};
pub use state::{JobKind, JobState};
pub use error::{
    CancelReason, ConfigError, ContractViolation, Failure, TaskError, TaskResult, TryEmitError,
    TryLockError,
};
pub use continuation::{Continuation, Suspended};
pub use frame::{Frame, Machine, Resume, StateMachine, Step};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};
