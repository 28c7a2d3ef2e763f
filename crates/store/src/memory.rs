//! In-memory backend for tests and development.
//!
//! All claim semantics run under a single write lock, which is the in-process
//! equivalent of the conditional-UPDATE atomicity the Postgres backend gets
//! from the database: an entire eligibility check + mutation is one
//! indivisible step, so each eligible task still goes to exactly one caller.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use relayq_core::{
    LockKey, LockStatus, NewTask, ResourceLock, ResourceRef, RetryPolicy, Task, TaskCounts,
    TaskId, TaskStatus, WorkerId,
};

use crate::dedup::{CompletionRecord, DedupGuard};
use crate::error::StoreError;
use crate::lock_store::LockStore;
use crate::task_store::{ClaimRequest, EnqueueOutcome, TaskStore};

/// In-memory task + lock store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    locks: RwLock<HashMap<LockKey, ResourceLock>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on a task only if `worker` still owns it; the whole check +
    /// mutation happens under the write lock, mirroring the single
    /// conditional statement the SQL backend uses.
    fn with_owned_task<F>(&self, task_id: TaskId, worker: &WorkerId, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(&task_id) {
            Some(task) if task.is_owned_by(worker) => {
                f(task);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn enqueue(&self, new: NewTask) -> Result<EnqueueOutcome, StoreError> {
        new.validate()?;

        let mut tasks = self.tasks.write().unwrap();
        if let Some(existing) = tasks.values().find(|t| {
            t.status.is_active()
                && t.resource_ref == new.resource_ref
                && t.task_type == new.task_type
        }) {
            return Ok(EnqueueOutcome::Duplicate(existing.id));
        }

        let task = Task::from_new(new, Utc::now());
        let id = task.id;
        tasks.insert(id, task);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<Task>, StoreError> {
        request.validate()?;

        let mut tasks = self.tasks.write().unwrap();
        let now = Utc::now();

        let mut eligible: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .filter(|t| {
                request
                    .task_type
                    .as_deref()
                    .is_none_or(|ty| t.task_type == ty)
            })
            .map(|t| t.id)
            .collect();

        // Priority first, FIFO within a priority; TaskId (UUIDv7) breaks the
        // remaining ties deterministically.
        eligible.sort_by_key(|id| {
            let t = &tasks[id];
            (t.priority, t.created_at, *id.as_uuid())
        });

        let mut claimed = Vec::new();
        for id in eligible.into_iter().take(request.limit) {
            let task = tasks.get_mut(&id).unwrap();
            task.begin_attempt(request.worker.clone(), request.lease_seconds, now);
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn renew(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        lease_seconds: u32,
    ) -> Result<bool, StoreError> {
        Ok(self.with_owned_task(task_id, worker, |task| {
            task.extend_lease(lease_seconds, Utc::now());
        }))
    }

    async fn ack(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        result_ref: Option<String>,
    ) -> Result<bool, StoreError> {
        Ok(self.with_owned_task(task_id, worker, |task| {
            task.complete(result_ref, Utc::now());
        }))
    }

    async fn fail_retry(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<bool, StoreError> {
        Ok(self.with_owned_task(task_id, worker, |task| {
            let now = Utc::now();
            let schedule = policy.next_schedule(task.attempts, task.max_attempts, now);
            task.fail(error, schedule, now);
        }))
    }

    async fn requeue_without_penalty(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        reason: &str,
        jitter_seconds: u32,
    ) -> Result<bool, StoreError> {
        Ok(self.with_owned_task(task_id, worker, |task| {
            task.requeue(reason, jitter_seconds, Utc::now());
        }))
    }

    async fn mark_dead(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.with_owned_task(task_id, worker, |task| {
            task.kill(error, Utc::now());
        }))
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().unwrap().get(&task_id).cloned())
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().unwrap();
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|t| (t.created_at, *t.id.as_uuid()));
        result.truncate(limit);
        Ok(result)
    }

    async fn count_by_status(&self) -> Result<TaskCounts, StoreError> {
        let tasks = self.tasks.read().unwrap();
        let mut counts = TaskCounts::default();
        for task in tasks.values() {
            counts.record(task.status);
        }
        Ok(counts)
    }

    async fn cleanup_completed(&self, older_than: Duration) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write().unwrap();
        let cutoff = Utc::now() - older_than;
        let before = tasks.len();
        tasks.retain(|_, t| !(t.status == TaskStatus::Completed && t.updated_at < cutoff));
        Ok((before - tasks.len()) as u64)
    }

    async fn reset_dead(&self, resource_ref: Option<&ResourceRef>) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write().unwrap();
        let now = Utc::now();
        let mut reset = 0;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Dead
                && resource_ref.is_none_or(|r| &task.resource_ref == r)
            {
                task.reset(now);
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn claim(
        &self,
        key: &LockKey,
        holder: &WorkerId,
        lease_seconds: u32,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().unwrap();
        let now = Utc::now();
        let lock = locks
            .entry(key.clone())
            .or_insert_with(|| ResourceLock::unheld(key.clone(), lease_seconds));

        if !lock.is_claimable_by(holder, now) {
            return Ok(false);
        }
        lock.grant(holder.clone(), lease_seconds, now);
        Ok(true)
    }

    async fn renew(
        &self,
        key: &LockKey,
        holder: &WorkerId,
        lease_seconds: Option<u32>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().unwrap();
        match locks.get_mut(key) {
            Some(lock) if lock.is_held_by(holder) => {
                let lease = lease_seconds.unwrap_or(lock.lease_seconds);
                lock.grant(holder.clone(), lease, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &LockKey, holder: &WorkerId) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().unwrap();
        match locks.get_mut(key) {
            Some(lock) if lock.is_held_by(holder) => {
                lock.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release(&self, key: &LockKey) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().unwrap();
        match locks.get_mut(key) {
            Some(lock) if lock.is_held() => {
                lock.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockStatus>, StoreError> {
        let locks = self.locks.read().unwrap();
        Ok(locks.get(key).map(|lock| lock.status(Utc::now())))
    }
}

#[async_trait]
impl DedupGuard for InMemoryStore {
    async fn check_dedup(
        &self,
        target: &ResourceRef,
        fingerprint: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let tasks = self.tasks.read().unwrap();
        let hit = tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Completed
                    && &t.resource_ref == target
                    && t.last_result_ref.as_deref() == Some(fingerprint)
            })
            .max_by_key(|t| (t.updated_at, *t.id.as_uuid()));

        Ok(hit.map(|t| CompletionRecord {
            task_id: t.id,
            resource_ref: t.resource_ref.clone(),
            task_type: t.task_type.clone(),
            result_ref: fingerprint.to_string(),
            completed_at: t.updated_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    // `TaskStore` and `LockStore` share method names (`claim`, `renew`,
    // `get`), so the lock tests below call through the trait explicitly and
    // this module only imports `TaskStore` for method syntax.
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use relayq_core::{LockKey, NewTask, ResourceRef, RetryPolicy, Task, TaskStatus, WorkerId};

    use crate::dedup::DedupGuard;
    use crate::error::StoreError;
    use crate::memory::InMemoryStore;
    use crate::task_store::{ClaimRequest, TaskStore};

    fn resource(name: &str) -> ResourceRef {
        ResourceRef::new(name).unwrap()
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    fn new_task(res: &str, ty: &str) -> NewTask {
        NewTask::new(resource(res), ty, serde_json::json!({}))
    }

    fn no_backoff() -> RetryPolicy {
        RetryPolicy::fixed(std::time::Duration::ZERO)
    }

    async fn claim_one(store: &InMemoryStore, w: &str) -> Option<Task> {
        store
            .claim(ClaimRequest::new(worker(w), 60))
            .await
            .unwrap()
            .into_iter()
            .next()
    }

    #[tokio::test]
    async fn enqueue_then_claim_round_trip() {
        let store = InMemoryStore::new();
        let outcome = store.enqueue(new_task("org/a", "sync")).await.unwrap();
        assert!(!outcome.is_duplicate());

        let task = claim_one(&store, "w1").await.unwrap();
        assert_eq!(task.id, outcome.task_id());
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.owner, Some(worker("w1")));
        assert!(task.lease_expiry.is_some());

        // Nothing else eligible.
        assert!(claim_one(&store, "w2").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_returns_signal_and_single_row() {
        let store = InMemoryStore::new();
        let first = store.enqueue(new_task("org/a", "sync")).await.unwrap();
        let second = store.enqueue(new_task("org/a", "sync")).await.unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.task_id(), first.task_id());

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn different_task_types_coexist_per_resource() {
        let store = InMemoryStore::new();
        assert!(!store
            .enqueue(new_task("org/a", "sync"))
            .await
            .unwrap()
            .is_duplicate());
        assert!(!store
            .enqueue(new_task("org/a", "deliver"))
            .await
            .unwrap()
            .is_duplicate());

        // Claimable independently, no cross-type exclusion.
        let batch = store
            .claim(ClaimRequest::new(worker("w1"), 60).with_limit(10))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn completed_task_does_not_block_re_enqueue() {
        let store = InMemoryStore::new();
        let first = store.enqueue(new_task("org/a", "sync")).await.unwrap();
        let task = claim_one(&store, "w1").await.unwrap();
        assert!(store.ack(task.id, &worker("w1"), None).await.unwrap());

        let second = store.enqueue(new_task("org/a", "sync")).await.unwrap();
        assert!(!second.is_duplicate());
        assert_ne!(second.task_id(), first.task_id());
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let store = InMemoryStore::new();
        for (res, priority) in [("org/a", 100), ("org/b", 50), ("org/c", 200)] {
            store
                .enqueue(new_task(res, "sync").with_priority(priority))
                .await
                .unwrap();
        }

        let task = claim_one(&store, "w1").await.unwrap();
        assert_eq!(task.priority, 50);

        // Same priority: oldest enqueued wins.
        let next = claim_one(&store, "w1").await.unwrap();
        assert_eq!(next.resource_ref, resource("org/a"));
    }

    #[tokio::test]
    async fn future_not_before_is_never_claimed_early() {
        let store = InMemoryStore::new();
        store
            .enqueue(
                new_task("org/a", "sync").scheduled_at(Utc::now() + Duration::seconds(3600)),
            )
            .await
            .unwrap();

        assert!(claim_one(&store, "w1").await.is_none());
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn type_filter_restricts_claims() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("org/a", "sync")).await.unwrap();
        store.enqueue(new_task("org/b", "deliver")).await.unwrap();

        let batch = store
            .claim(
                ClaimRequest::new(worker("w1"), 60)
                    .with_task_type("deliver")
                    .with_limit(10),
            )
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].task_type, "deliver");
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_with_new_owner() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("org/a", "sync")).await.unwrap();

        // Zero-second lease: expired the moment it is granted.
        let first = store
            .claim(ClaimRequest::new(worker("w1"), 0))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(first.attempts, 1);

        let reclaimed = claim_one(&store, "w2").await.unwrap();
        assert_eq!(reclaimed.id, first.id);
        assert_eq!(reclaimed.owner, Some(worker("w2")));
        assert_eq!(reclaimed.attempts, 2);

        // The usurped worker's ack must lose.
        assert!(!store.ack(first.id, &worker("w1"), None).await.unwrap());
        // The current owner's ack wins.
        assert!(store.ack(first.id, &worker("w2"), None).await.unwrap());
    }

    #[tokio::test]
    async fn live_lease_is_not_reclaimable() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("org/a", "sync")).await.unwrap();
        claim_one(&store, "w1").await.unwrap();

        assert!(claim_one(&store, "w2").await.is_none());
    }

    #[tokio::test]
    async fn renew_extends_only_for_the_owner() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("org/a", "sync")).await.unwrap();
        let task = claim_one(&store, "w1").await.unwrap();

        assert!(store.renew(task.id, &worker("w1"), 120).await.unwrap());
        let renewed = store.get(task.id).await.unwrap().unwrap();
        assert!(renewed.lease_expiry.unwrap() > task.lease_expiry.unwrap());

        assert!(!store.renew(task.id, &worker("w2"), 120).await.unwrap());
    }

    #[tokio::test]
    async fn ack_stores_result_ref_and_keeps_attempts() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("org/a", "sync")).await.unwrap();
        let task = claim_one(&store, "w1").await.unwrap();

        assert!(store
            .ack(task.id, &worker("w1"), Some("sha:abc123".into()))
            .await
            .unwrap());

        let done = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.last_result_ref.as_deref(), Some("sha:abc123"));
        assert!(done.owner.is_none() && done.lease_expiry.is_none());
    }

    #[tokio::test]
    async fn fail_retry_requeues_then_dead_letters_at_max() {
        let store = InMemoryStore::new();
        store
            .enqueue(new_task("org/a", "sync").with_max_attempts(2))
            .await
            .unwrap();

        let task = claim_one(&store, "w1").await.unwrap();
        assert!(store
            .fail_retry(task.id, &worker("w1"), "boom", &no_backoff())
            .await
            .unwrap());
        let after_first = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(after_first.status, TaskStatus::Pending);
        assert_eq!(after_first.attempts, 1);
        assert_eq!(after_first.last_error.as_deref(), Some("boom"));

        let task = claim_one(&store, "w1").await.unwrap();
        assert_eq!(task.attempts, 2);
        assert!(store
            .fail_retry(task.id, &worker("w1"), "boom again", &no_backoff())
            .await
            .unwrap());
        let after_second = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(after_second.status, TaskStatus::Dead);
        assert_eq!(after_second.attempts, 2);

        // Dead tasks are invisible to claim.
        assert!(claim_one(&store, "w1").await.is_none());
    }

    #[tokio::test]
    async fn fail_retry_applies_backoff_delay() {
        let store = InMemoryStore::new();
        store
            .enqueue(new_task("org/a", "sync").with_max_attempts(5))
            .await
            .unwrap();

        let task = claim_one(&store, "w1").await.unwrap();
        let policy = RetryPolicy::fixed(std::time::Duration::from_secs(300));
        assert!(store
            .fail_retry(task.id, &worker("w1"), "boom", &policy)
            .await
            .unwrap());

        // Backed off into the future: pending but not claimable.
        let pending = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);
        assert!(pending.not_before > Utc::now() + Duration::seconds(200));
        assert!(claim_one(&store, "w2").await.is_none());
    }

    #[tokio::test]
    async fn requeue_without_penalty_nets_attempts_to_zero() {
        let store = InMemoryStore::new();
        store
            .enqueue(new_task("org/a", "sync").with_max_attempts(2))
            .await
            .unwrap();

        // Far more claim/requeue cycles than the retry budget: the task must
        // never drift toward dead.
        for _ in 0..10 {
            let task = claim_one(&store, "w1").await.unwrap();
            assert!(store
                .requeue_without_penalty(task.id, &worker("w1"), "resource locked", 0)
                .await
                .unwrap());
        }

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.dead, 0);

        let task = claim_one(&store, "w1").await.unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_error.as_deref(), Some("resource locked"));
    }

    #[tokio::test]
    async fn mark_dead_ignores_remaining_budget() {
        let store = InMemoryStore::new();
        store
            .enqueue(new_task("org/a", "sync").with_max_attempts(10))
            .await
            .unwrap();
        let task = claim_one(&store, "w1").await.unwrap();

        assert!(store
            .mark_dead(task.id, &worker("w1"), "unrecoverable payload")
            .await
            .unwrap());
        let dead = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(dead.status, TaskStatus::Dead);
        assert_eq!(dead.last_error.as_deref(), Some("unrecoverable payload"));
    }

    #[tokio::test]
    async fn ownership_mismatch_mutations_are_noops() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("org/a", "sync")).await.unwrap();
        let task = claim_one(&store, "w1").await.unwrap();
        let intruder = worker("w2");

        assert!(!store.ack(task.id, &intruder, None).await.unwrap());
        assert!(!store
            .fail_retry(task.id, &intruder, "x", &no_backoff())
            .await
            .unwrap());
        assert!(!store
            .requeue_without_penalty(task.id, &intruder, "x", 0)
            .await
            .unwrap());
        assert!(!store.mark_dead(task.id, &intruder, "x").await.unwrap());
        assert!(!store.renew(task.id, &intruder, 30).await.unwrap());

        let unchanged = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Running);
        assert_eq!(unchanged.owner, Some(worker("w1")));
        assert_eq!(unchanged.attempts, 1);
    }

    #[tokio::test]
    async fn terminal_task_rejects_further_mutation() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("org/a", "sync")).await.unwrap();
        let task = claim_one(&store, "w1").await.unwrap();
        assert!(store.ack(task.id, &worker("w1"), None).await.unwrap());

        // Owner cleared at completion; nothing mutates a terminal task.
        assert!(!store.ack(task.id, &worker("w1"), None).await.unwrap());
        assert!(!store
            .fail_retry(task.id, &worker("w1"), "late", &no_backoff())
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn single_winner_under_concurrent_claims() {
        let store = Arc::new(InMemoryStore::new());
        store.enqueue(new_task("org/a", "sync")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .claim(ClaimRequest::new(worker(&format!("w{i}")), 60))
                    .await
                    .unwrap()
                    .len()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            winners += handle.await.unwrap();
        }
        assert_eq!(winners, 1);

        let task = store
            .list_by_status(TaskStatus::Running, 10)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_claims_partition_a_batch() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..20 {
            store
                .enqueue(new_task(&format!("org/r{i}"), "sync"))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .claim(ClaimRequest::new(worker(&format!("w{i}")), 60).with_limit(5))
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|t| t.id)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                // No task handed to two workers.
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_completed_tasks() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("org/a", "sync")).await.unwrap();
        store.enqueue(new_task("org/b", "sync")).await.unwrap();

        let task = store
            .claim(ClaimRequest::new(worker("w1"), 60).with_task_type("sync"))
            .await
            .unwrap()
            .remove(0);
        store.ack(task.id, &worker("w1"), None).await.unwrap();

        // Everything is newer than the cutoff.
        assert_eq!(
            store.cleanup_completed(Duration::hours(1)).await.unwrap(),
            0
        );
        // Zero-age cutoff sweeps the completed row, leaves the rest alone.
        assert_eq!(
            store.cleanup_completed(Duration::zero()).await.unwrap(),
            1
        );
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.pending + counts.running, 1);
    }

    #[tokio::test]
    async fn reset_dead_restores_claimability() {
        let store = InMemoryStore::new();
        store
            .enqueue(new_task("org/a", "sync").with_max_attempts(1))
            .await
            .unwrap();
        store
            .enqueue(new_task("org/b", "sync").with_max_attempts(1))
            .await
            .unwrap();

        for task in store
            .claim(ClaimRequest::new(worker("w1"), 60).with_limit(10))
            .await
            .unwrap()
        {
            store
                .fail_retry(task.id, &worker("w1"), "boom", &no_backoff())
                .await
                .unwrap();
        }
        assert_eq!(store.count_by_status().await.unwrap().dead, 2);

        // Scoped reset touches one resource only.
        let reset = store.reset_dead(Some(&resource("org/a"))).await.unwrap();
        assert_eq!(reset, 1);
        let revived = claim_one(&store, "w2").await.unwrap();
        assert_eq!(revived.resource_ref, resource("org/a"));
        assert_eq!(revived.attempts, 1); // fresh budget, this is the first claim

        // Unscoped reset picks up the rest.
        assert_eq!(store.reset_dead(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn validation_errors_are_raised_not_applied() {
        let store = InMemoryStore::new();

        let invalid = new_task("org/a", "sync").with_max_attempts(0);
        assert!(matches!(
            store.enqueue(invalid).await,
            Err(StoreError::Validation(_))
        ));
        assert_eq!(store.count_by_status().await.unwrap().pending, 0);

        let zero_limit = ClaimRequest::new(worker("w1"), 60).with_limit(0);
        assert!(matches!(
            store.claim(zero_limit).await,
            Err(StoreError::Validation(_))
        ));
    }

    mod locks {
        use super::*;
        use crate::lock_store::LockStore;

        fn key(name: &str) -> LockKey {
            LockKey::new(name).unwrap()
        }

        #[tokio::test]
        async fn mutual_exclusion_until_lease_elapses() {
            let store = InMemoryStore::new();
            let k = key("org/a/mirror");

            assert!(LockStore::claim(&store, &k, &worker("a"), 60).await.unwrap());
            assert!(!LockStore::claim(&store, &k, &worker("b"), 60).await.unwrap());

            let status = LockStore::get(&store, &k).await.unwrap().unwrap();
            assert!(status.is_locked);
            assert_eq!(status.holder, Some(worker("a")));
        }

        #[tokio::test]
        async fn expired_lease_is_reclaimable_by_others() {
            let store = InMemoryStore::new();
            let k = key("org/a/mirror");

            // Zero lease: abandoned immediately, but still reported held.
            assert!(LockStore::claim(&store, &k, &worker("a"), 0).await.unwrap());
            let status = LockStore::get(&store, &k).await.unwrap().unwrap();
            assert!(status.is_locked && status.is_expired);
            assert_eq!(status.holder, Some(worker("a")));

            assert!(LockStore::claim(&store, &k, &worker("b"), 60).await.unwrap());
            let status = LockStore::get(&store, &k).await.unwrap().unwrap();
            assert_eq!(status.holder, Some(worker("b")));
            assert!(!status.is_expired);
        }

        #[tokio::test]
        async fn self_claim_refreshes_the_lease() {
            let store = InMemoryStore::new();
            let k = key("org/a/mirror");

            assert!(LockStore::claim(&store, &k, &worker("a"), 60).await.unwrap());
            assert!(LockStore::claim(&store, &k, &worker("a"), 120).await.unwrap());
            assert!(!LockStore::claim(&store, &k, &worker("b"), 60).await.unwrap());
        }

        #[tokio::test]
        async fn renew_and_release_are_ownership_checked() {
            let store = InMemoryStore::new();
            let k = key("org/a/mirror");

            assert!(LockStore::claim(&store, &k, &worker("a"), 60).await.unwrap());
            assert!(LockStore::renew(&store, &k, &worker("a"), None).await.unwrap());
            assert!(!LockStore::renew(&store, &k, &worker("b"), None).await.unwrap());
            assert!(!LockStore::release(&store, &k, &worker("b")).await.unwrap());

            assert!(LockStore::release(&store, &k, &worker("a")).await.unwrap());
            // Released: anyone may take it immediately.
            assert!(LockStore::claim(&store, &k, &worker("b"), 60).await.unwrap());
            // Double release of an unheld lock is a no-op false.
            assert!(!LockStore::release(&store, &k, &worker("a")).await.unwrap());
        }

        #[tokio::test]
        async fn force_release_ignores_holder_identity() {
            let store = InMemoryStore::new();
            let k = key("org/a/mirror");

            assert!(!LockStore::force_release(&store, &k).await.unwrap());
            assert!(LockStore::claim(&store, &k, &worker("a"), 600).await.unwrap());
            assert!(LockStore::force_release(&store, &k).await.unwrap());
            assert!(LockStore::claim(&store, &k, &worker("b"), 60).await.unwrap());
        }

        #[tokio::test]
        async fn unknown_lock_reports_none() {
            let store = InMemoryStore::new();
            assert!(LockStore::get(&store, &key("never/created"))
                .await
                .unwrap()
                .is_none());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
        async fn single_winner_under_concurrent_lock_claims() {
            let store = Arc::new(InMemoryStore::new());
            let k = key("org/a/mirror");

            let mut handles = Vec::new();
            for i in 0..16 {
                let store = Arc::clone(&store);
                let k = k.clone();
                handles.push(tokio::spawn(async move {
                    LockStore::claim(&*store, &k, &worker(&format!("w{i}")), 60)
                        .await
                        .unwrap()
                }));
            }

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }

    mod dedup {
        use super::*;

        #[tokio::test]
        async fn completed_work_is_found_by_fingerprint() {
            let store = InMemoryStore::new();
            store.enqueue(new_task("org/a", "deliver")).await.unwrap();
            let task = claim_one(&store, "w1").await.unwrap();
            store
                .ack(task.id, &worker("w1"), Some("fp:1234".into()))
                .await
                .unwrap();

            let hit = store
                .check_dedup(&resource("org/a"), "fp:1234")
                .await
                .unwrap()
                .expect("dedup hit");
            assert_eq!(hit.task_id, task.id);
            assert_eq!(hit.result_ref, "fp:1234");

            // Different fingerprint or target: no hit.
            assert!(store
                .check_dedup(&resource("org/a"), "fp:other")
                .await
                .unwrap()
                .is_none());
            assert!(store
                .check_dedup(&resource("org/b"), "fp:1234")
                .await
                .unwrap()
                .is_none());
        }

        #[tokio::test]
        async fn non_completed_records_never_match() {
            let store = InMemoryStore::new();
            store
                .enqueue(new_task("org/a", "deliver").with_max_attempts(1))
                .await
                .unwrap();
            let task = claim_one(&store, "w1").await.unwrap();

            // Running task with no completion: no hit even on its resource.
            assert!(store
                .check_dedup(&resource("org/a"), "fp:1234")
                .await
                .unwrap()
                .is_none());

            // Dead task: still no hit.
            store
                .fail_retry(task.id, &worker("w1"), "boom", &no_backoff())
                .await
                .unwrap();
            assert_eq!(store.count_by_status().await.unwrap().dead, 1);
            assert!(store
                .check_dedup(&resource("org/a"), "fp:1234")
                .await
                .unwrap()
                .is_none());
        }

        #[tokio::test]
        async fn most_recent_completion_wins() {
            let store = InMemoryStore::new();

            for _ in 0..2 {
                store.enqueue(new_task("org/a", "deliver")).await.unwrap();
                let task = claim_one(&store, "w1").await.unwrap();
                store
                    .ack(task.id, &worker("w1"), Some("fp:1234".into()))
                    .await
                    .unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }

            let latest_completed = store
                .list_by_status(TaskStatus::Completed, 10)
                .await
                .unwrap()
                .last()
                .unwrap()
                .id;
            let hit = store
                .check_dedup(&resource("org/a"), "fp:1234")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(hit.task_id, latest_completed);
        }
    }
}
