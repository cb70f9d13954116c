//! Sink for uncaught task failures

use strand_core::error::TaskError;
use strand_core::kerror;

/// Receives failures nobody above the failing task took responsibility for
///
/// Cancellations are never reported. Implementations must not block: they
/// run on whatever thread finished the failing task.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &TaskError);
}

impl<F> ErrorReporter for F
where
    F: Fn(&TaskError) + Send + Sync,
{
    fn report(&self, error: &TaskError) {
        self(error)
    }
}

/// Default reporter: one `kerror!` line per failure
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &TaskError) {
        kerror!("uncaught task failure: {}", error);
    }
}
