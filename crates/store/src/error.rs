//! Store error model.
//!
//! Three kinds, deliberately narrow:
//!
//! - `Validation` — the caller violated the contract; raised synchronously,
//!   never partially applied.
//! - `Database` — the store itself failed (unreachable, timeout, constraint
//!   machinery). Transient; the worker loop retries the *store operation*,
//!   which is orthogonal to task-level retry.
//! - `Serialization` — a payload refused to round-trip.
//!
//! Ownership mismatches, duplicate enqueues, and held locks are **not**
//! errors; they are routine return values on the hot path.

use thiserror::Error;

use relayq_core::DomainError;

/// Store-layer error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Contract violation by the caller.
    #[error("validation failed: {0}")]
    Validation(#[from] DomainError),

    /// The backing store failed during `operation`.
    #[error("storage failure during {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A stored value could not be decoded into its domain shape.
    #[error("storage error: {0}")]
    Storage(String),

    /// Payload serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn database(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Database { operation, source }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True when the caller should retry the store call itself after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database { .. })
    }
}
