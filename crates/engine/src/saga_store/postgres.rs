//! Postgres-backed saga store implementation.
//!
//! ## Schema
//!
//! - `saga_instances`: one row per instance, keyed by `correlation_id`, carrying a
//!   `version` column for optimistic concurrency
//! - `saga_outbox`: outbound envelopes staged in the same transaction as the
//!   instance write, with `dispatched_at` set once the Transport accepted them
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | SagaStoreError | Scenario |
//! |------------|----------------------|----------------|----------|
//! | Database (unique violation) | `23505` | `DuplicateInstance` | Concurrent starter inserted the same correlation id |
//! | `UPDATE` affected 0 rows | N/A | `StaleWrite` | Instance changed since it was read |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / Other | N/A | `Backend` | Connection pool closed, network errors |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use sagabus_core::{CorrelationId, MessageId};
use sagabus_messages::MessageEnvelope;

use super::r#trait::{
    ArmedTimeout, OutboxEntry, SagaInstance, SagaStatus, SagaStore, SagaStoreError,
    SagaTransaction,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS saga_instances (
        correlation_id   TEXT PRIMARY KEY,
        saga_type        TEXT NOT NULL,
        status           TEXT NOT NULL,
        state            JSONB NOT NULL,
        version          BIGINT NOT NULL CHECK (version > 0),
        timeout_deadline TIMESTAMPTZ NULL,
        applied_messages JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS saga_instances_armed_idx
        ON saga_instances (timeout_deadline)
        WHERE status = 'active' AND timeout_deadline IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saga_outbox (
        message_id     UUID PRIMARY KEY,
        correlation_id TEXT NULL,
        envelope       JSONB NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        dispatched_at  TIMESTAMPTZ NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS saga_outbox_pending_idx
        ON saga_outbox (created_at)
        WHERE dispatched_at IS NULL
    "#,
];

/// Postgres-backed saga store.
///
/// ## Optimistic Concurrency
///
/// `update()` issues `UPDATE ... WHERE correlation_id = $1 AND version = $n`. When
/// another transaction committed in between, zero rows match and the write fails
/// with `StaleWrite`. Concurrent inserts of one id collide on the primary key
/// (`DuplicateInstance`).
#[derive(Debug, Clone)]
pub struct PostgresSagaStore {
    pool: Arc<PgPool>,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SagaStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), SagaStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn begin(&self) -> Result<Box<dyn SagaTransaction>, SagaStoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresSagaTransaction { tx }))
    }

    #[instrument(skip(self), fields(entry_count = tracing::field::Empty), err)]
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, SagaStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, correlation_id, envelope, created_at
            FROM saga_outbox
            WHERE dispatched_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(outbox_from_row(&row)?);
        }

        Span::current().record("entry_count", entries.len());
        Ok(entries)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn mark_dispatched(&self, ids: &[MessageId]) -> Result<(), SagaStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();

        sqlx::query(
            r#"
            UPDATE saga_outbox
            SET dispatched_at = NOW()
            WHERE message_id = ANY($1) AND dispatched_at IS NULL
            "#,
        )
        .bind(ids)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_dispatched", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn armed_timeouts(&self) -> Result<Vec<ArmedTimeout>, SagaStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, saga_type, timeout_deadline, version
            FROM saga_instances
            WHERE status = 'active' AND timeout_deadline IS NOT NULL
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("armed_timeouts", e))?;

        rows.iter()
            .map(|row| {
                let correlation_id: String = row.try_get("correlation_id").map_err(decode_error)?;
                let saga_type: String = row.try_get("saga_type").map_err(decode_error)?;
                let deadline: DateTime<Utc> = row.try_get("timeout_deadline").map_err(decode_error)?;
                let version: i64 = row.try_get("version").map_err(decode_error)?;
                Ok(ArmedTimeout {
                    correlation_id: CorrelationId::new(correlation_id),
                    saga_type,
                    deadline,
                    version: version as u64,
                })
            })
            .collect()
    }
}

/// One Postgres transaction; dropped without commit it rolls back.
pub struct PostgresSagaTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SagaTransaction for PostgresSagaTransaction {
    #[instrument(skip(self), fields(correlation_id = %id), err)]
    async fn get_instance(&mut self, id: &CorrelationId) -> Result<SagaInstance, SagaStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                correlation_id,
                saga_type,
                status,
                state,
                version,
                timeout_deadline,
                applied_messages,
                created_at,
                updated_at
            FROM saga_instances
            WHERE correlation_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_instance", e))?;

        match row {
            Some(row) => instance_from_row(&row),
            None => Err(SagaStoreError::NotFound(id.clone())),
        }
    }

    #[instrument(skip(self, instance), fields(correlation_id = %instance.id, saga_type = %instance.saga_type), err)]
    async fn save_new(&mut self, instance: SagaInstance) -> Result<(), SagaStoreError> {
        let applied = encode_applied(&instance.applied_messages)?;

        sqlx::query(
            r#"
            INSERT INTO saga_instances (
                correlation_id,
                saga_type,
                status,
                state,
                version,
                timeout_deadline,
                applied_messages,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, 1, $5, $6, $7, NOW())
            "#,
        )
        .bind(instance.id.as_str())
        .bind(&instance.saga_type)
        .bind(instance.status.as_str())
        .bind(&instance.state)
        .bind(instance.timeout_deadline)
        .bind(&applied)
        .bind(instance.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                SagaStoreError::DuplicateInstance(instance.id.clone())
            } else {
                map_sqlx_error("save_new", e)
            }
        })?;

        Ok(())
    }

    #[instrument(
        skip(self, instance),
        fields(correlation_id = %instance.id, expected_version = instance.version),
        err
    )]
    async fn update(&mut self, instance: SagaInstance) -> Result<(), SagaStoreError> {
        let applied = encode_applied(&instance.applied_messages)?;

        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET status = $3,
                state = $4,
                version = version + 1,
                timeout_deadline = $5,
                applied_messages = $6,
                updated_at = NOW()
            WHERE correlation_id = $1 AND version = $2
            "#,
        )
        .bind(instance.id.as_str())
        .bind(instance.version as i64)
        .bind(instance.status.as_str())
        .bind(&instance.state)
        .bind(instance.timeout_deadline)
        .bind(&applied)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(SagaStoreError::StaleWrite {
                id: instance.id,
                expected: instance.version,
            });
        }
        Ok(())
    }

    #[instrument(skip(self, envelopes), fields(count = envelopes.len()), err)]
    async fn stage_outbox(&mut self, envelopes: &[MessageEnvelope]) -> Result<(), SagaStoreError> {
        for envelope in envelopes {
            let message_id = *envelope.message_id().as_uuid();
            let body = serde_json::to_value(envelope)
                .map_err(|e| SagaStoreError::Serialization(format!("outbox envelope: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO saga_outbox (message_id, correlation_id, envelope)
                VALUES ($1, $2, $3)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(message_id)
            .bind(envelope.correlation_id().map(|c| c.as_str()))
            .bind(&body)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("stage_outbox", e))?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SagaStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), SagaStoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn encode_applied(ids: &[MessageId]) -> Result<serde_json::Value, SagaStoreError> {
    serde_json::to_value(ids)
        .map_err(|e| SagaStoreError::Serialization(format!("applied_messages: {e}")))
}

fn decode_error(err: sqlx::Error) -> SagaStoreError {
    SagaStoreError::Serialization(format!("failed to decode row: {err}"))
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<SagaInstance, SagaStoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let status = SagaStatus::parse(&status)
        .ok_or_else(|| SagaStoreError::Serialization(format!("unknown saga status '{status}'")))?;

    let version: i64 = row.try_get("version").map_err(decode_error)?;
    let applied: serde_json::Value = row.try_get("applied_messages").map_err(decode_error)?;
    let applied_messages: Vec<MessageId> = serde_json::from_value(applied)
        .map_err(|e| SagaStoreError::Serialization(format!("applied_messages: {e}")))?;
    let id: String = row.try_get("correlation_id").map_err(decode_error)?;

    Ok(SagaInstance {
        id: CorrelationId::new(id),
        saga_type: row.try_get("saga_type").map_err(decode_error)?,
        status,
        state: row.try_get("state").map_err(decode_error)?,
        version: version as u64,
        timeout_deadline: row.try_get("timeout_deadline").map_err(decode_error)?,
        applied_messages,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn outbox_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, SagaStoreError> {
    let message_id: Uuid = row.try_get("message_id").map_err(decode_error)?;
    let correlation_id: Option<String> = row.try_get("correlation_id").map_err(decode_error)?;
    let body: serde_json::Value = row.try_get("envelope").map_err(decode_error)?;
    let envelope: MessageEnvelope = serde_json::from_value(body)
        .map_err(|e| SagaStoreError::Serialization(format!("outbox envelope: {e}")))?;

    Ok(OutboxEntry {
        message_id: MessageId::from_uuid(message_id),
        correlation_id: correlation_id.map(CorrelationId::new),
        envelope,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Map SQLx errors to SagaStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SagaStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            SagaStoreError::Backend(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            SagaStoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            SagaStoreError::Backend(format!("unexpected row not found in {}", operation))
        }
        _ => SagaStoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
