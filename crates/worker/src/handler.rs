//! Handler registration types.

use std::future::Future;
use std::pin::Pin;

use relayq_core::Task;

/// What the handler wants done with the task it just ran.
///
/// The variants map one-to-one onto store terminal calls; the worker loop
/// performs the call and the handler never touches task state itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Ack, optionally recording a completion fingerprint for dedup.
    Complete(Option<String>),
    /// Count the attempt and retry on the backoff curve.
    Retry(String),
    /// Hand the task back without spending retry budget (e.g. a dependent
    /// resource lock was unavailable); retried after the given jitter.
    RetryWithoutPenalty { reason: String, jitter_seconds: u32 },
    /// Give up for good regardless of remaining budget.
    Fatal(String),
}

impl TaskOutcome {
    pub fn complete() -> Self {
        Self::Complete(None)
    }

    pub fn complete_with(result_ref: impl Into<String>) -> Self {
        Self::Complete(Some(result_ref.into()))
    }

    pub fn retry(error: impl Into<String>) -> Self {
        Self::Retry(error.into())
    }

    pub fn requeue(reason: impl Into<String>, jitter_seconds: u32) -> Self {
        Self::RetryWithoutPenalty {
            reason: reason.into(),
            jitter_seconds,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self::Fatal(error.into())
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

/// Async task handler, registered per task type. Receives the claimed task
/// by value; the payload is whatever the producer enqueued.
pub type TaskHandler = Box<dyn Fn(Task) -> HandlerFuture + Send + Sync>;
