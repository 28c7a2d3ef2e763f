//! Postgres-backed task and lock store.
//!
//! Every mutating operation is a single conditional statement, so the
//! ownership / eligibility check and the mutation are one atomic step from
//! any concurrent caller's point of view. Lease comparisons use the
//! database's own `now()`, keeping one clock authoritative regardless of
//! worker clock skew.
//!
//! ## Error mapping
//!
//! All sqlx failures surface as `StoreError::Database` tagged with the
//! operation name; rows that refuse to decode into domain types surface as
//! `StoreError::Storage`. Expected races never reach the error path: they
//! are `rows_affected() == 0` and come back as `false`/`Duplicate`/`None`.
//!
//! ## Thread safety
//!
//! Wraps a `PgPool`; clone freely and share across workers.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use relayq_core::{
    LockKey, LockStatus, NewTask, ResourceLock, ResourceRef, RetryPolicy, Task, TaskCounts,
    TaskId, TaskStatus, WorkerId,
};

use crate::dedup::{CompletionRecord, DedupGuard};
use crate::error::StoreError;
use crate::lock_store::LockStore;
use crate::schema;
use crate::task_store::{ClaimRequest, EnqueueOutcome, TaskStore};

use async_trait::async_trait;

/// Postgres backend.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

const TASK_COLUMNS: &str = "id, resource_ref, task_type, priority, status, attempts, \
     max_attempts, owner, lease_expiry, not_before, last_error, last_result_ref, \
     payload, created_at, updated_at";

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a bounded pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StoreError::database("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the schema idempotently.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in schema::ALL {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::database("migrate", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let decode = |e: sqlx::Error| StoreError::database("decode task row", e);

    let status: String = row.try_get("status").map_err(decode)?;
    let resource_ref: String = row.try_get("resource_ref").map_err(decode)?;
    let owner: Option<String> = row.try_get("owner").map_err(decode)?;

    Ok(Task {
        id: TaskId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
        resource_ref: ResourceRef::new(resource_ref)
            .map_err(|e| StoreError::storage(format!("stored resource_ref: {e}")))?,
        task_type: row.try_get("task_type").map_err(decode)?,
        priority: row.try_get("priority").map_err(decode)?,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::storage(format!("stored status: {e}")))?,
        attempts: row.try_get::<i32, _>("attempts").map_err(decode)?.max(0) as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(decode)?.max(1) as u32,
        owner: owner
            .map(WorkerId::new)
            .transpose()
            .map_err(|e| StoreError::storage(format!("stored owner: {e}")))?,
        lease_expiry: row.try_get("lease_expiry").map_err(decode)?,
        not_before: row.try_get("not_before").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        last_result_ref: row.try_get("last_result_ref").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl TaskStore for PostgresStore {
    #[instrument(skip(self, new), fields(resource = %new.resource_ref, task_type = %new.task_type), err)]
    async fn enqueue(&self, new: NewTask) -> Result<EnqueueOutcome, StoreError> {
        new.validate()?;

        // The partial unique index on active (resource_ref, task_type) makes
        // the insert-or-skip race-free; a lost insert falls through to the
        // lookup of whichever active row won.
        for _ in 0..2 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO tasks
                    (id, resource_ref, task_type, priority, status, attempts,
                     max_attempts, not_before, payload)
                VALUES ($1, $2, $3, $4, 'pending', 0, $5, COALESCE($6, now()), $7)
                ON CONFLICT (resource_ref, task_type)
                    WHERE status IN ('pending', 'running')
                    DO NOTHING
                RETURNING id
                "#,
            )
            .bind(*TaskId::new().as_uuid())
            .bind(new.resource_ref.as_str())
            .bind(&new.task_type)
            .bind(new.priority)
            .bind(new.max_attempts as i32)
            .bind(new.not_before)
            .bind(&new.payload)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("enqueue", e))?;

            if let Some(row) = inserted {
                let id = TaskId::from_uuid(
                    row.try_get::<Uuid, _>("id")
                        .map_err(|e| StoreError::database("enqueue", e))?,
                );
                return Ok(EnqueueOutcome::Enqueued(id));
            }

            let existing = sqlx::query(
                r#"
                SELECT id FROM tasks
                WHERE resource_ref = $1 AND task_type = $2
                  AND status IN ('pending', 'running')
                LIMIT 1
                "#,
            )
            .bind(new.resource_ref.as_str())
            .bind(&new.task_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("enqueue", e))?;

            if let Some(row) = existing {
                let id = TaskId::from_uuid(
                    row.try_get::<Uuid, _>("id")
                        .map_err(|e| StoreError::database("enqueue", e))?,
                );
                debug!(task_id = %id, "enqueue deduplicated against active task");
                return Ok(EnqueueOutcome::Duplicate(id));
            }
            // The duplicate completed between our insert and lookup; retry.
        }

        Err(StoreError::storage(
            "enqueue lost two insert/lookup races in a row",
        ))
    }

    #[instrument(skip(self, request), fields(worker = %request.worker, limit = request.limit), err)]
    async fn claim(&self, request: ClaimRequest) -> Result<Vec<Task>, StoreError> {
        request.validate()?;

        // One statement: eligibility, ordering, and the lease grant. SKIP
        // LOCKED partitions concurrent callers onto disjoint rows, so each
        // eligible row has exactly one winner.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE tasks SET
                status = 'running',
                owner = $1,
                lease_expiry = now() + make_interval(secs => $2::double precision),
                attempts = attempts + 1,
                updated_at = now()
            WHERE id IN (
                SELECT id FROM tasks
                WHERE ((status = 'pending' AND not_before <= now())
                    OR (status = 'running' AND lease_expiry <= now()))
                  AND ($3::text IS NULL OR task_type = $3)
                ORDER BY priority ASC, created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(request.worker.as_str())
        .bind(f64::from(request.lease_seconds))
        .bind(request.task_type.as_deref())
        .bind(request.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("claim", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            claimed.push(task_from_row(row)?);
        }
        // Claim ordering is decided inside the statement; RETURNING order is
        // not guaranteed, so restore it for callers that process in order.
        claimed.sort_by(|a, b| {
            (a.priority, a.created_at, *a.id.as_uuid())
                .cmp(&(b.priority, b.created_at, *b.id.as_uuid()))
        });
        Ok(claimed)
    }

    async fn renew(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        lease_seconds: u32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                lease_expiry = now() + make_interval(secs => $3::double precision),
                updated_at = now()
            WHERE id = $1 AND status = 'running' AND owner = $2
            "#,
        )
        .bind(*task_id.as_uuid())
        .bind(worker.as_str())
        .bind(f64::from(lease_seconds))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("renew", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, result_ref), fields(task_id = %task_id, worker = %worker), err)]
    async fn ack(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        result_ref: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'completed',
                owner = NULL,
                lease_expiry = NULL,
                last_result_ref = $3,
                updated_at = now()
            WHERE id = $1 AND status = 'running' AND owner = $2
            "#,
        )
        .bind(*task_id.as_uuid())
        .bind(worker.as_str())
        .bind(result_ref)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("ack", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, policy), fields(task_id = %task_id, worker = %worker), err)]
    async fn fail_retry(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<bool, StoreError> {
        // Read the budget first to compute the schedule; the UPDATE then
        // re-verifies ownership atomically, so a lease lost in between
        // surfaces as rows_affected = 0, never as a misapplied write.
        let current = sqlx::query(
            r#"
            SELECT attempts, max_attempts FROM tasks
            WHERE id = $1 AND status = 'running' AND owner = $2
            "#,
        )
        .bind(*task_id.as_uuid())
        .bind(worker.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("fail_retry", e))?;

        let Some(row) = current else {
            return Ok(false);
        };
        let attempts = row
            .try_get::<i32, _>("attempts")
            .map_err(|e| StoreError::database("fail_retry", e))?
            .max(0) as u32;
        let max_attempts = row
            .try_get::<i32, _>("max_attempts")
            .map_err(|e| StoreError::database("fail_retry", e))?
            .max(1) as u32;

        let schedule = policy.next_schedule(attempts, max_attempts, Utc::now());

        let result = if schedule.terminal {
            sqlx::query(
                r#"
                UPDATE tasks SET
                    status = 'dead',
                    owner = NULL,
                    lease_expiry = NULL,
                    last_error = $3,
                    updated_at = now()
                WHERE id = $1 AND status = 'running' AND owner = $2
                "#,
            )
            .bind(*task_id.as_uuid())
            .bind(worker.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE tasks SET
                    status = 'pending',
                    owner = NULL,
                    lease_expiry = NULL,
                    not_before = $4,
                    last_error = $3,
                    updated_at = now()
                WHERE id = $1 AND status = 'running' AND owner = $2
                "#,
            )
            .bind(*task_id.as_uuid())
            .bind(worker.as_str())
            .bind(error)
            .bind(schedule.not_before)
            .execute(&self.pool)
            .await
        }
        .map_err(|e| StoreError::database("fail_retry", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue_without_penalty(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        reason: &str,
        jitter_seconds: u32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'pending',
                owner = NULL,
                lease_expiry = NULL,
                attempts = GREATEST(attempts - 1, 0),
                not_before = now() + make_interval(secs => $4::double precision),
                last_error = $3,
                updated_at = now()
            WHERE id = $1 AND status = 'running' AND owner = $2
            "#,
        )
        .bind(*task_id.as_uuid())
        .bind(worker.as_str())
        .bind(reason)
        .bind(f64::from(jitter_seconds))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("requeue_without_penalty", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_dead(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'dead',
                owner = NULL,
                lease_expiry = NULL,
                last_error = $3,
                updated_at = now()
            WHERE id = $1 AND status = 'running' AND owner = $2
            "#,
        )
        .bind(*task_id.as_uuid())
        .bind(worker.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("mark_dead", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(*task_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("get", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("list_by_status", e))?;
        rows.iter().map(task_from_row).collect()
    }

    async fn count_by_status(&self) -> Result<TaskCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::database("count_by_status", e))?;

        let mut counts = TaskCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::database("count_by_status", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| StoreError::database("count_by_status", e))?;
            let n = n.max(0) as u64;
            match status
                .parse::<TaskStatus>()
                .map_err(|e| StoreError::storage(format!("stored status: {e}")))?
            {
                TaskStatus::Pending => counts.pending += n,
                TaskStatus::Running => counts.running += n,
                TaskStatus::Completed => counts.completed += n,
                TaskStatus::Failed => counts.failed += n,
                TaskStatus::Dead => counts.dead += n,
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn cleanup_completed(&self, older_than: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status = 'completed'
              AND updated_at < now() - make_interval(secs => $1::double precision)
            "#,
        )
        .bind(older_than.num_milliseconds() as f64 / 1000.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("cleanup_completed", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn reset_dead(&self, resource_ref: Option<&ResourceRef>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'pending',
                attempts = 0,
                owner = NULL,
                lease_expiry = NULL,
                not_before = now(),
                updated_at = now()
            WHERE status = 'dead'
              AND ($1::text IS NULL OR resource_ref = $1)
            "#,
        )
        .bind(resource_ref.map(ResourceRef::as_str))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("reset_dead", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LockStore for PostgresStore {
    #[instrument(skip(self), fields(key = %key, holder = %holder), err)]
    async fn claim(
        &self,
        key: &LockKey,
        holder: &WorkerId,
        lease_seconds: u32,
    ) -> Result<bool, StoreError> {
        // Upsert with the claimability predicate in the conflict clause:
        // free, expired, or already ours. A live foreign hold updates zero
        // rows and the claim reports false.
        let result = sqlx::query(
            r#"
            INSERT INTO locks (resource_key, holder, held_since, lease_seconds)
            VALUES ($1, $2, now(), $3)
            ON CONFLICT (resource_key) DO UPDATE SET
                holder = EXCLUDED.holder,
                held_since = now(),
                lease_seconds = EXCLUDED.lease_seconds
            WHERE locks.holder IS NULL
               OR locks.holder = EXCLUDED.holder
               OR locks.held_since
                    + make_interval(secs => locks.lease_seconds::double precision)
                    <= now()
            "#,
        )
        .bind(key.as_str())
        .bind(holder.as_str())
        .bind(lease_seconds as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("lock claim", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew(
        &self,
        key: &LockKey,
        holder: &WorkerId,
        lease_seconds: Option<u32>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE locks SET
                held_since = now(),
                lease_seconds = COALESCE($3, lease_seconds)
            WHERE resource_key = $1 AND holder = $2
            "#,
        )
        .bind(key.as_str())
        .bind(holder.as_str())
        .bind(lease_seconds.map(|s| s as i32))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("lock renew", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &LockKey, holder: &WorkerId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE locks SET holder = NULL, held_since = NULL
            WHERE resource_key = $1 AND holder = $2
            "#,
        )
        .bind(key.as_str())
        .bind(holder.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("lock release", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn force_release(&self, key: &LockKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE locks SET holder = NULL, held_since = NULL
            WHERE resource_key = $1 AND holder IS NOT NULL
            "#,
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("lock force_release", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockStatus>, StoreError> {
        // Expiry is judged against the database clock, same as claim.
        let row = sqlx::query(
            r#"
            SELECT resource_key, holder, held_since, lease_seconds, now() AS db_now
            FROM locks WHERE resource_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("lock get", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e: sqlx::Error| StoreError::database("lock get", e);

        let holder: Option<String> = row.try_get("holder").map_err(decode)?;
        let lock = ResourceLock {
            resource_key: key.clone(),
            holder: holder
                .map(WorkerId::new)
                .transpose()
                .map_err(|e| StoreError::storage(format!("stored holder: {e}")))?,
            held_since: row.try_get("held_since").map_err(decode)?,
            lease_seconds: row.try_get::<i32, _>("lease_seconds").map_err(decode)?.max(0) as u32,
        };
        let db_now: DateTime<Utc> = row.try_get("db_now").map_err(decode)?;
        Ok(Some(lock.status(db_now)))
    }
}

#[async_trait]
impl DedupGuard for PostgresStore {
    async fn check_dedup(
        &self,
        target: &ResourceRef,
        fingerprint: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, resource_ref, task_type, last_result_ref, updated_at
            FROM tasks
            WHERE resource_ref = $1
              AND last_result_ref = $2
              AND status = 'completed'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(target.as_str())
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("check_dedup", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e: sqlx::Error| StoreError::database("check_dedup", e);

        Ok(Some(CompletionRecord {
            task_id: TaskId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
            resource_ref: target.clone(),
            task_type: row.try_get("task_type").map_err(decode)?,
            result_ref: fingerprint.to_string(),
            completed_at: row.try_get("updated_at").map_err(decode)?,
        }))
    }
}
