//! Task-aware synchronization

mod mutex;

pub use mutex::{Lock, Mutex, MutexGuard};
