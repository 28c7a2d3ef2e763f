//! The task model and its status machine.
//!
//! A [`Task`] is a unit of schedulable work: opaque payload, scheduling
//! metadata, and a lease. The transition helpers here encode the status
//! machine; backends are responsible for applying them atomically (the
//! in-memory store under its write lock, Postgres as single conditional
//! statements mirroring the same transitions).

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ResourceRef, TaskId, WorkerId};
use crate::retry::Schedule;

/// Task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker holding a live lease
    Running,
    /// Completed successfully (terminal)
    Completed,
    /// Recorded failure, not currently scheduled
    Failed,
    /// Exhausted retries or explicitly killed (terminal unless reset)
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Dead)
    }

    /// Active statuses participate in the enqueue duplicate check.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead" => Ok(TaskStatus::Dead),
            other => Err(DomainError::validation(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Request to enqueue a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub resource_ref: ResourceRef,
    pub task_type: String,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub not_before: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(
        resource_ref: ResourceRef,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            resource_ref,
            task_type: task_type.into(),
            priority: 100,
            payload,
            max_attempts: 3,
            not_before: None,
        }
    }

    /// Lower value is served first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay first eligibility until the given instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Check the enqueue contract. Violations are synchronous errors, never
    /// partially applied.
    pub fn validate(&self) -> DomainResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(DomainError::validation("task_type must not be empty"));
        }
        if self.max_attempts < 1 {
            return Err(DomainError::validation("max_attempts must be >= 1"));
        }
        Ok(())
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub resource_ref: ResourceRef,
    pub task_type: String,
    pub priority: i32,
    pub status: TaskStatus,
    /// Count of claims ever granted. Incremented by claim only; decremented
    /// (floor 0) by requeue-without-penalty only.
    pub attempts: u32,
    pub max_attempts: u32,
    pub owner: Option<WorkerId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub not_before: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Opaque caller-supplied completion marker; dedup lookups key on it.
    pub last_result_ref: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Materialize a validated enqueue request as a pending row.
    pub fn from_new(new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            resource_ref: new.resource_ref,
            task_type: new.task_type,
            priority: new.priority,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            owner: None,
            lease_expiry: None,
            not_before: new.not_before.unwrap_or(now),
            last_error: None,
            last_result_ref: None,
            payload: new.payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// The one eligibility predicate: a fresh pending task whose schedule has
    /// arrived, or a running task whose lease lapsed (crash recovery). Both
    /// are claimed through the same path so they can never drift apart.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => self.not_before <= now,
            TaskStatus::Running => self.lease_expiry.is_some_and(|expiry| expiry <= now),
            _ => false,
        }
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.status == TaskStatus::Running && self.owner.as_ref() == Some(worker)
    }

    /// Grant a claim: running, leased to `worker`, attempts + 1.
    pub fn begin_attempt(&mut self, worker: WorkerId, lease_seconds: u32, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.owner = Some(worker);
        self.lease_expiry = Some(now + chrono::Duration::seconds(i64::from(lease_seconds)));
        self.attempts += 1;
        self.updated_at = now;
    }

    /// Extend the current lease from `now`.
    pub fn extend_lease(&mut self, lease_seconds: u32, now: DateTime<Utc>) {
        self.lease_expiry = Some(now + chrono::Duration::seconds(i64::from(lease_seconds)));
        self.updated_at = now;
    }

    /// Terminal success. Attempts unchanged.
    pub fn complete(&mut self, result_ref: Option<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.owner = None;
        self.lease_expiry = None;
        self.last_result_ref = result_ref;
        self.updated_at = now;
    }

    /// Record a failed attempt. The schedule decides between backoff-requeue
    /// and dead-letter. Attempts unchanged (claim already counted it).
    pub fn fail(&mut self, error: impl Into<String>, schedule: Schedule, now: DateTime<Utc>) {
        self.owner = None;
        self.lease_expiry = None;
        self.last_error = Some(error.into());
        self.updated_at = now;
        if schedule.terminal {
            self.status = TaskStatus::Dead;
        } else {
            self.status = TaskStatus::Pending;
            self.not_before = schedule.not_before;
        }
    }

    /// Hand the task back without spending retry budget: the attempt the
    /// claim counted is compensated here, floored at 0, so claim/requeue
    /// cycles never drift toward dead.
    pub fn requeue(&mut self, reason: impl Into<String>, jitter_seconds: u32, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.owner = None;
        self.lease_expiry = None;
        self.attempts = self.attempts.saturating_sub(1);
        self.not_before = now + chrono::Duration::seconds(i64::from(jitter_seconds));
        self.last_error = Some(reason.into());
        self.updated_at = now;
    }

    /// Unconditional dead-letter, regardless of remaining budget.
    pub fn kill(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Dead;
        self.owner = None;
        self.lease_expiry = None;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// Administrative reset of a dead task back to a fresh pending one.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.owner = None;
        self.lease_expiry = None;
        self.not_before = now;
        self.updated_at = now;
    }
}

/// Queue depth per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl TaskCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Dead => self.dead += 1,
        }
    }
}
