//! Idempotency guard over completed task history.
//!
//! A worker that crashed after its side effect landed but before its own
//! bookkeeping advanced will be handed the same unit of work again. Before
//! re-executing, it asks whether this exact `(target, fingerprint)` already
//! completed once; a hit means short-circuit to success with the prior
//! record instead of re-running the side effect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use relayq_core::{ResourceRef, TaskId};

use crate::error::StoreError;

/// Prior completion evidence returned by a dedup hit.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub task_id: TaskId,
    pub resource_ref: ResourceRef,
    pub task_type: String,
    /// The fingerprint the completing worker recorded at ack time.
    pub result_ref: String,
    pub completed_at: DateTime<Utc>,
}

/// Lookup of the most recent **completed** task matching
/// `(resource_ref, fingerprint)`. Pending, running, failed, and dead tasks
/// never count as completed for dedup purposes.
#[async_trait]
pub trait DedupGuard: Send + Sync {
    async fn check_dedup(
        &self,
        target: &ResourceRef,
        fingerprint: &str,
    ) -> Result<Option<CompletionRecord>, StoreError>;
}
