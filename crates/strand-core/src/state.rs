//! Job lifecycle state

use core::fmt;

/// Lifecycle state of a job
///
/// ```text
///  Active ──body done──► Completing ──children done──► Completed
///    │                        │
///    └──cancel / failure──────┴──► Cancelling ──children + body done──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    /// Running its body, or waiting to be completed (bodiless jobs)
    Active = 0,

    /// Body finished, waiting for children to become terminal
    Completing = 1,

    /// Cancel requested or failure recorded; waiting for body and children
    Cancelling = 2,

    /// Terminal: cancelled or failed
    Cancelled = 3,

    /// Terminal: finished normally with all children terminal
    Completed = 4,
}

impl JobState {
    /// Active or Completing
    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(self, JobState::Active | JobState::Completing)
    }

    /// Cancelled or Completed
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, JobState::Cancelled | JobState::Completed)
    }

    /// Cancelling or Cancelled
    #[inline]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, JobState::Cancelling | JobState::Cancelled)
    }

    /// Whether a new child may attach in this state
    #[inline]
    pub const fn accepts_children(&self) -> bool {
        self.is_active()
    }
}

impl From<u8> for JobState {
    fn from(v: u8) -> Self {
        match v {
            0 => JobState::Active,
            1 => JobState::Completing,
            2 => JobState::Cancelling,
            3 => JobState::Cancelled,
            _ => JobState::Completed,
        }
    }
}

impl From<JobState> for u8 {
    fn from(state: JobState) -> u8 {
        state as u8
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Active => write!(f, "ACTIVE"),
            JobState::Completing => write!(f, "COMPLETING"),
            JobState::Cancelling => write!(f, "CANCELLING"),
            JobState::Cancelled => write!(f, "CANCELLED"),
            JobState::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// Supervision policy of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobKind {
    /// Child failure cancels this job and every sibling
    #[default]
    Plain,

    /// Child failure stays with the child
    Supervisor,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Plain => write!(f, "plain"),
            JobKind::Supervisor => write!(f, "supervisor"),
        }
    }
}
