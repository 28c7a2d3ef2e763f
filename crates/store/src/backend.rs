//! Backend selection.
//!
//! One closed set of tagged variants behind the capability interface,
//! chosen once at startup by explicit configuration. Call sites hold a
//! `StoreBackend` (or a trait object) and never know which variant runs
//! underneath.

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use relayq_core::{
    LockKey, LockStatus, NewTask, ResourceRef, RetryPolicy, Task, TaskCounts, TaskId, TaskStatus,
    WorkerId,
};

use crate::dedup::{CompletionRecord, DedupGuard};
use crate::error::StoreError;
use crate::lock_store::LockStore;
use crate::memory::InMemoryStore;
use crate::postgres::PostgresStore;
use crate::task_store::{ClaimRequest, EnqueueOutcome, TaskStore};

/// Explicit backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Volatile store; tests and local development.
    InMemory,
    /// Shared Postgres; production.
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

/// The closed set of store backends.
#[derive(Debug)]
pub enum StoreBackend {
    InMemory(InMemoryStore),
    Postgres(PostgresStore),
}

impl StoreBackend {
    /// Build the backend the configuration names. The Postgres variant
    /// applies the schema before returning.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        match config {
            StoreConfig::InMemory => Ok(Self::InMemory(InMemoryStore::new())),
            StoreConfig::Postgres {
                url,
                max_connections,
            } => {
                let store = PostgresStore::connect(url, *max_connections).await?;
                store.migrate().await?;
                Ok(Self::Postgres(store))
            }
        }
    }
}

macro_rules! delegate {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        match $self {
            StoreBackend::InMemory(store) => store.$method($($arg),*).await,
            StoreBackend::Postgres(store) => store.$method($($arg),*).await,
        }
    };
}

#[async_trait]
impl TaskStore for StoreBackend {
    async fn enqueue(&self, new: NewTask) -> Result<EnqueueOutcome, StoreError> {
        delegate!(self.enqueue(new))
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<Task>, StoreError> {
        match self {
            StoreBackend::InMemory(store) => TaskStore::claim(store, request).await,
            StoreBackend::Postgres(store) => TaskStore::claim(store, request).await,
        }
    }

    async fn renew(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        lease_seconds: u32,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::InMemory(store) => {
                TaskStore::renew(store, task_id, worker, lease_seconds).await
            }
            StoreBackend::Postgres(store) => {
                TaskStore::renew(store, task_id, worker, lease_seconds).await
            }
        }
    }

    async fn ack(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        result_ref: Option<String>,
    ) -> Result<bool, StoreError> {
        delegate!(self.ack(task_id, worker, result_ref))
    }

    async fn fail_retry(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<bool, StoreError> {
        delegate!(self.fail_retry(task_id, worker, error, policy))
    }

    async fn requeue_without_penalty(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        reason: &str,
        jitter_seconds: u32,
    ) -> Result<bool, StoreError> {
        delegate!(self.requeue_without_penalty(task_id, worker, reason, jitter_seconds))
    }

    async fn mark_dead(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<bool, StoreError> {
        delegate!(self.mark_dead(task_id, worker, error))
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        match self {
            StoreBackend::InMemory(store) => TaskStore::get(store, task_id).await,
            StoreBackend::Postgres(store) => TaskStore::get(store, task_id).await,
        }
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        delegate!(self.list_by_status(status, limit))
    }

    async fn count_by_status(&self) -> Result<TaskCounts, StoreError> {
        delegate!(self.count_by_status())
    }

    async fn cleanup_completed(&self, older_than: Duration) -> Result<u64, StoreError> {
        delegate!(self.cleanup_completed(older_than))
    }

    async fn reset_dead(&self, resource_ref: Option<&ResourceRef>) -> Result<u64, StoreError> {
        delegate!(self.reset_dead(resource_ref))
    }
}

#[async_trait]
impl LockStore for StoreBackend {
    async fn claim(
        &self,
        key: &LockKey,
        holder: &WorkerId,
        lease_seconds: u32,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::InMemory(store) => {
                LockStore::claim(store, key, holder, lease_seconds).await
            }
            StoreBackend::Postgres(store) => {
                LockStore::claim(store, key, holder, lease_seconds).await
            }
        }
    }

    async fn renew(
        &self,
        key: &LockKey,
        holder: &WorkerId,
        lease_seconds: Option<u32>,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::InMemory(store) => {
                LockStore::renew(store, key, holder, lease_seconds).await
            }
            StoreBackend::Postgres(store) => {
                LockStore::renew(store, key, holder, lease_seconds).await
            }
        }
    }

    async fn release(&self, key: &LockKey, holder: &WorkerId) -> Result<bool, StoreError> {
        delegate!(self.release(key, holder))
    }

    async fn force_release(&self, key: &LockKey) -> Result<bool, StoreError> {
        delegate!(self.force_release(key))
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockStatus>, StoreError> {
        match self {
            StoreBackend::InMemory(store) => LockStore::get(store, key).await,
            StoreBackend::Postgres(store) => LockStore::get(store, key).await,
        }
    }
}

#[async_trait]
impl DedupGuard for StoreBackend {
    async fn check_dedup(
        &self,
        target: &ResourceRef,
        fingerprint: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        delegate!(self.check_dedup(target, fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_config_connects_and_serves() {
        let backend = StoreBackend::connect(&StoreConfig::InMemory).await.unwrap();

        let outcome = backend
            .enqueue(NewTask::new(
                ResourceRef::new("org/a").unwrap(),
                "sync",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert!(!outcome.is_duplicate());

        let claimed =
            TaskStore::claim(&backend, ClaimRequest::new(WorkerId::new("w1").unwrap(), 60))
                .await
                .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config: StoreConfig = serde_json::from_value(serde_json::json!({
            "kind": "postgres",
            "url": "postgres://localhost/relayq"
        }))
        .unwrap();
        match config {
            StoreConfig::Postgres {
                max_connections, ..
            } => assert_eq!(max_connections, 10),
            other => panic!("unexpected config: {other:?}"),
        }
    }
}
