//! Error types for the strand runtime
//!
//! Three kinds of error travel through a task's result channel:
//!
//! - **Cancellation** (`TaskError::Cancelled`) - expected and cooperative.
//!   Never reported as an application error.
//! - **Failure** (`Failed`, `Panicked`, `Timeout`) - escalated up the job tree.
//! - **Contract violation** (`Contract`) - programmer error, meant to be
//!   caught by tests.

use core::fmt;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Result type for task bodies and suspension points
pub type TaskResult<T> = Result<T, TaskError>;

/// Why a job was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on the job or its scope
    Requested,

    /// An ancestor was cancelled or failed
    ParentCancelled,

    /// A child failed and took this job down with it
    ChildFailed,

    /// A `with_timeout` deadline elapsed
    Deadline,

    /// The runtime is shutting down
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancel requested"),
            CancelReason::ParentCancelled => write!(f, "parent cancelled"),
            CancelReason::ChildFailed => write!(f, "child failed"),
            CancelReason::Deadline => write!(f, "deadline elapsed"),
            CancelReason::Shutdown => write!(f, "runtime shutdown"),
        }
    }
}

/// Programmer errors detected by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractViolation {
    /// A continuation was resumed twice
    AlreadyResumed,

    /// A task tried to lock a mutex it already holds
    ReentrantLock,

    /// A child tried to attach to a job that is cancelling or terminal
    AttachToInactiveJob,

    /// A task-only operation was used outside of any task
    NoTaskContext,

    /// A deferred result was taken twice
    ResultAlreadyTaken,

    /// The main dispatcher was requested but no host queue was installed
    MainDispatcherMissing,
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractViolation::AlreadyResumed => write!(f, "continuation already resumed"),
            ContractViolation::ReentrantLock => write!(f, "mutex is already held by this task"),
            ContractViolation::AttachToInactiveJob => {
                write!(f, "cannot attach a child to a cancelling or terminal job")
            }
            ContractViolation::NoTaskContext => write!(f, "not running inside a task"),
            ContractViolation::ResultAlreadyTaken => write!(f, "deferred result already taken"),
            ContractViolation::MainDispatcherMissing => write!(f, "no main dispatcher installed"),
        }
    }
}

/// An application error raised inside a task body
///
/// Cheap to clone: the source is shared so that every awaiter of a failed
/// task and the job tree see the same error.
#[derive(Clone)]
pub struct Failure(Arc<dyn Error + Send + Sync + 'static>);

impl Failure {
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Failure(Arc::new(err))
    }

    /// Failure carrying only a message
    pub fn msg(message: impl Into<String>) -> Self {
        Failure(Arc::new(MessageError(message.into())))
    }

    /// Access the underlying error
    pub fn source_ref(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.0
    }

    /// Try to view the underlying error as a concrete type
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Whether two failures share the same underlying error instance
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failure({:?})", self.0)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for MessageError {}

/// Errors observed by task bodies, joiners and error reporters
#[derive(Debug, Clone)]
pub enum TaskError {
    /// Cooperative cancellation (expected)
    Cancelled(CancelReason),

    /// A `with_timeout` block did not finish in time
    Timeout(Duration),

    /// The task body returned an error
    Failed(Failure),

    /// The task body panicked
    Panicked(String),

    /// Programmer error
    Contract(ContractViolation),
}

impl TaskError {
    /// Build a failure from any error value
    pub fn failed<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        TaskError::Failed(Failure::new(err))
    }

    /// Build a failure from a message
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Failed(Failure::msg(message))
    }

    /// Whether this is the expected cancellation kind
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    /// Whether this error should be escalated up the job tree
    #[inline]
    pub fn is_failure(&self) -> bool {
        !self.is_cancellation()
    }

    #[inline]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, TaskError::Contract(_))
    }

    /// The cancellation reason, if this is a cancellation
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            TaskError::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Cancelled(reason) => write!(f, "task cancelled: {}", reason),
            TaskError::Timeout(d) => write!(f, "timed out after {:?}", d),
            TaskError::Failed(failure) => write!(f, "task failed: {}", failure),
            TaskError::Panicked(msg) => write!(f, "task panicked: {}", msg),
            TaskError::Contract(v) => write!(f, "contract violation: {}", v),
        }
    }
}

impl Error for TaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TaskError::Failed(failure) => Some(failure.source_ref()),
            _ => None,
        }
    }
}

impl From<ContractViolation> for TaskError {
    fn from(v: ContractViolation) -> Self {
        TaskError::Contract(v)
    }
}

impl From<Failure> for TaskError {
    fn from(f: Failure) -> Self {
        TaskError::Failed(f)
    }
}

/// Error returned by non-suspending emission on a full broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryEmitError<T>(pub T);

impl<T> fmt::Display for TryEmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broadcast buffer full")
    }
}

impl<T: fmt::Debug> Error for TryEmitError<T> {}

/// Error returned when a mutex cannot be acquired without suspending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockError {
    /// Held by another task
    Locked,

    /// Held by the calling task
    Reentrant,
}

impl fmt::Display for TryLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryLockError::Locked => write!(f, "mutex is locked"),
            TryLockError::Reentrant => write!(f, "mutex is already held by this task"),
        }
    }
}

impl Error for TryLockError {}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl Error for ConfigError {}
