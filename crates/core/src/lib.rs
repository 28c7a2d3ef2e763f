//! `relayq-core` — domain foundation for the lease-based task queue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the task model and its status machine, the retry/backoff policy, the
//! resource-lock model, and the strongly-typed identifiers shared by every
//! backend. Nothing in here performs I/O; all coordination semantics live in
//! the store layer, which enforces them with atomic conditional writes.

pub mod error;
pub mod id;
pub mod lock;
pub mod retry;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{LockKey, ResourceRef, TaskId, WorkerId};
pub use lock::{LockStatus, ResourceLock};
pub use retry::{BackoffStrategy, RetryPolicy, Schedule};
pub use task::{NewTask, Task, TaskCounts, TaskStatus};
