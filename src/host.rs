//! Example checkpoint persistence backend (feature `postgres`), analogous to
//! a real production deployment: `save_checkpoint` and `schedule_blocking`
//! are still the host's concern per the `Scheduler` contract (spec §6), but
//! a host usually wants blobs durable across process restarts rather than
//! held in memory like `LocalScheduler`. Not required to exercise the core;
//! gated behind the `postgres` feature so the base crate stays dependency-free
//! of a database driver.

use async_trait::async_trait;
use uuid::Uuid;

use crate::async_task::{BlockingTask, NonBlockingTask, ResumeCallback};
use crate::error::EngineError;
use crate::runtime_state::ContextToken;
use crate::scheduler::Scheduler;
use crate::value::RuntimeValue;

/// Wraps another `Scheduler` and redirects `save_checkpoint` to a Postgres
/// table, leaving blocking/event dispatch to the wrapped scheduler. This
/// mirrors the teacher corpus's own split between dispatch (`engine.rs`)
/// and durable storage (`store_postgres.rs`) rather than folding both
/// concerns into one type.
pub struct PostgresScheduler<S> {
    inner: S,
    pool: sqlx::PgPool,
}

impl<S: Scheduler> PostgresScheduler<S> {
    pub fn new(inner: S, pool: sqlx::PgPool) -> Self {
        Self { inner, pool }
    }

    /// Creates the `checkpoints` table if it doesn't already exist. A real
    /// deployment would run this via `sqlx::migrate!` against a migrations
    /// directory checked into the host application; this crate ships only
    /// the table shape, not a migration runner, since it isn't the thing a
    /// checkpoint-persisting host actually needs from the engine.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                instance_id UUID NOT NULL,
                checkpoint_id UUID NOT NULL,
                source_id TEXT NOT NULL,
                source_offset INTEGER NOT NULL,
                bytes BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (instance_id, checkpoint_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_checkpoint(
        &self,
        instance_id: Uuid,
        checkpoint_id: Uuid,
    ) -> Result<Option<StoredCheckpoint>, sqlx::Error> {
        use sqlx::Row;
        let row = sqlx::query(
            "SELECT bytes, created_at FROM checkpoints WHERE instance_id = $1 AND checkpoint_id = $2",
        )
        .bind(instance_id)
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredCheckpoint {
            bytes: r.get::<Vec<u8>, _>("bytes"),
            created_at: r.get::<chrono::DateTime<chrono::Utc>, _>("created_at"),
        }))
    }
}

/// A checkpoint blob as persisted, with the wall-clock time it was written —
/// useful for a host wanting to prune or audit old checkpoints.
pub struct StoredCheckpoint {
    pub bytes: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait(?Send)]
impl<S: Scheduler> Scheduler for PostgresScheduler<S> {
    async fn schedule_blocking(&self, task: BlockingTask) -> Result<RuntimeValue, EngineError> {
        self.inner.schedule_blocking(task).await
    }

    fn schedule_event(&self, thread_ctx_token: ContextToken, task: NonBlockingTask) {
        self.inner.schedule_event(thread_ctx_token, task)
    }

    fn thread_context(&self) -> ContextToken {
        self.inner.thread_context()
    }

    async fn save_checkpoint(
        &self,
        instance_id: Uuid,
        checkpoint_id: Uuid,
        bytes: Vec<u8>,
        source_id: String,
        offset: u32,
        _data: Vec<RuntimeValue>,
        resume: ResumeCallback,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (instance_id, checkpoint_id, source_id, source_offset, bytes)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (instance_id, checkpoint_id) DO UPDATE SET
                source_id = EXCLUDED.source_id,
                source_offset = EXCLUDED.source_offset,
                bytes = EXCLUDED.bytes
            "#,
        )
        .bind(instance_id)
        .bind(checkpoint_id)
        .bind(&source_id)
        .bind(offset as i32)
        .bind(&bytes)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => resume(Ok(RuntimeValue::Null)),
            Err(e) => resume(Err(EngineError::Internal(crate::error::InternalError::new(format!(
                "failed to persist checkpoint {checkpoint_id} for instance {instance_id}: {e}"
            ))))),
        }
    }
}
