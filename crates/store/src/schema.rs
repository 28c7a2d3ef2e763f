//! Canonical schema for the `tasks` and `locks` relations.
//!
//! Kept as constants next to the Postgres backend so the conditional SQL and
//! the shape it relies on live in one crate. `PostgresStore::migrate()`
//! applies them idempotently.

/// The `tasks` relation.
///
/// The check constraint pins the core invariant: `owner`/`lease_expiry` are
/// non-null exactly while `status = 'running'`.
pub const CREATE_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              UUID PRIMARY KEY,
    resource_ref    TEXT NOT NULL,
    task_type       TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 100,
    status          TEXT NOT NULL DEFAULT 'pending',
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL,
    owner           TEXT,
    lease_expiry    TIMESTAMPTZ,
    not_before      TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_error      TEXT,
    last_result_ref TEXT,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT tasks_status_valid CHECK (
        status IN ('pending', 'running', 'completed', 'failed', 'dead')
    ),
    CONSTRAINT tasks_max_attempts_positive CHECK (max_attempts >= 1),
    CONSTRAINT tasks_lease_iff_running CHECK (
        (status = 'running') = (owner IS NOT NULL AND lease_expiry IS NOT NULL)
    )
)
"#;

/// Enqueue-dedup rule: at most one active task per logical unit of work.
pub const CREATE_TASKS_ACTIVE_UNIQUE: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS tasks_active_unit_of_work
    ON tasks (resource_ref, task_type)
    WHERE status IN ('pending', 'running')
"#;

/// Supports "find eligible tasks ordered by priority/creation".
pub const CREATE_TASKS_CLAIM_ORDER: &str = r#"
CREATE INDEX IF NOT EXISTS tasks_claim_order
    ON tasks (status, priority, created_at)
"#;

/// Supports dedup lookups over completed history.
pub const CREATE_TASKS_DEDUP_LOOKUP: &str = r#"
CREATE INDEX IF NOT EXISTS tasks_dedup_lookup
    ON tasks (resource_ref, last_result_ref)
    WHERE status = 'completed'
"#;

/// The `locks` relation.
pub const CREATE_LOCKS: &str = r#"
CREATE TABLE IF NOT EXISTS locks (
    resource_key  TEXT PRIMARY KEY,
    holder        TEXT,
    held_since    TIMESTAMPTZ,
    lease_seconds INTEGER NOT NULL,
    CONSTRAINT locks_held_consistent CHECK (
        (holder IS NULL) = (held_since IS NULL)
    )
)
"#;

/// All statements, in application order.
pub const ALL: &[&str] = &[
    CREATE_TASKS,
    CREATE_TASKS_ACTIVE_UNIQUE,
    CREATE_TASKS_CLAIM_ORDER,
    CREATE_TASKS_DEDUP_LOOKUP,
    CREATE_LOCKS,
];
