//! `relayq-store` — the coordination layer over the shared transactional store.
//!
//! ## Design
//!
//! - One capability interface ([`TaskStore`] + [`LockStore`] + [`DedupGuard`])
//!   implemented by a small closed set of backends, selected once at startup
//!   by explicit [`StoreConfig`] — never by environment sniffing.
//! - Every mutating operation re-verifies ownership inside its atomic
//!   condition; a cached "I own this" flag is never trusted.
//! - Expected races (ownership loss, held locks, duplicate enqueues) come
//!   back as values, not errors. Errors mean contract violations or the
//!   store itself failing.
//!
//! ## Components
//!
//! - `TaskStore`: enqueue/claim/ack/fail lifecycle with leases and dead-letter
//! - `LockStore`: binary mutual exclusion keyed by resource
//! - `DedupGuard`: completed-history lookup for idempotent re-delivery
//! - `InMemoryStore`: tests/dev backend, races resolved under one lock
//! - `PostgresStore`: production backend, races resolved by conditional SQL

pub mod backend;
pub mod dedup;
pub mod error;
pub mod lock_store;
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod task_store;

pub use backend::{StoreBackend, StoreConfig};
pub use dedup::{CompletionRecord, DedupGuard};
pub use error::StoreError;
pub use lock_store::LockStore;
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use task_store::{ClaimRequest, EnqueueOutcome, TaskStore};
