//! Task store capability interface.

use async_trait::async_trait;
use chrono::Duration;

use relayq_core::{
    DomainError, NewTask, ResourceRef, RetryPolicy, Task, TaskCounts, TaskId, TaskStatus, WorkerId,
};

use crate::error::StoreError;

/// Result of an enqueue attempt.
///
/// `Duplicate` is a signal, not an error: a task for the same
/// `(resource_ref, task_type)` is already pending or running, so the logical
/// unit of work is covered and no row was inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(TaskId),
    Duplicate(TaskId),
}

impl EnqueueOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Enqueued(id) | Self::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Parameters of a claim poll.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker: WorkerId,
    /// Restrict to one task type; `None` claims across all types.
    pub task_type: Option<String>,
    /// Maximum rows to claim in this poll.
    pub limit: usize,
    /// Lease duration granted to each claimed row.
    pub lease_seconds: u32,
}

impl ClaimRequest {
    pub fn new(worker: WorkerId, lease_seconds: u32) -> Self {
        Self {
            worker,
            task_type: None,
            limit: 1,
            lease_seconds,
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.limit < 1 {
            return Err(DomainError::validation("claim limit must be >= 1"));
        }
        Ok(())
    }
}

/// CRUD and atomic claim primitives over the `tasks` relation.
///
/// Every mutating operation that takes a `worker` checks ownership
/// (`status = running AND owner = worker`) as part of its atomic condition
/// and reports an expected race as `Ok(false)` with no state change.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a pending task unless an active duplicate exists.
    async fn enqueue(&self, new: NewTask) -> Result<EnqueueOutcome, StoreError>;

    /// Claim up to `limit` eligible tasks for `worker`.
    ///
    /// Eligibility is one predicate: pending with `not_before` reached, or
    /// running with an expired lease (crash recovery — structurally the same
    /// claim, so `attempts` is incremented either way). Ordered by ascending
    /// priority, then creation (FIFO). Under concurrent callers each eligible
    /// row goes to exactly one winner.
    async fn claim(&self, request: ClaimRequest) -> Result<Vec<Task>, StoreError>;

    /// Extend the lease of a task this worker still owns.
    async fn renew(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        lease_seconds: u32,
    ) -> Result<bool, StoreError>;

    /// Complete a task this worker still owns. `false` means another worker
    /// reclaimed the lease; the caller must not assume its side effect won.
    async fn ack(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        result_ref: Option<String>,
    ) -> Result<bool, StoreError>;

    /// Record a failed attempt. The policy maps the already-counted attempt
    /// to a backoff schedule; exhaustion dead-letters instead of requeueing.
    async fn fail_retry(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<bool, StoreError>;

    /// Hand a task back untouched by the retry budget: pending again after
    /// `jitter_seconds`, with the claim's attempt increment compensated
    /// (floor 0). For transient non-errors such as an unavailable lock.
    async fn requeue_without_penalty(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        reason: &str,
        jitter_seconds: u32,
    ) -> Result<bool, StoreError>;

    /// Force a task this worker owns straight to dead, budget or not.
    async fn mark_dead(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// Diagnostic read.
    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// List tasks in a status, oldest first.
    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Queue depth per status.
    async fn count_by_status(&self) -> Result<TaskCounts, StoreError>;

    /// Retention: delete completed tasks untouched for `older_than`.
    /// Returns the number removed. Only `completed` rows are ever destroyed.
    async fn cleanup_completed(&self, older_than: Duration) -> Result<u64, StoreError>;

    /// Administrative reset: dead tasks (optionally scoped to one resource)
    /// back to pending with a fresh retry budget. Returns the number reset.
    async fn reset_dead(&self, resource_ref: Option<&ResourceRef>) -> Result<u64, StoreError>;
}
