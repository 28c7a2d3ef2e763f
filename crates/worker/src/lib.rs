//! `relayq-worker` — thin polling orchestration over the task store.
//!
//! Any number of these loops may run against the same store with no process
//! affinity; all correctness comes from the store's atomic claims. The loop
//! itself stays mechanical: claim, run the registered handler, report the
//! outcome, sleep when idle. Store failures pause the loop one poll interval
//! and never kill the process.

pub mod handler;
pub mod worker;

pub use handler::{TaskHandler, TaskOutcome};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};
