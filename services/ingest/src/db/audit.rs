//! Postgres audit log.

use async_trait::async_trait;
use sqlx::postgres::PgPool;

use crate::audit::{AuditEntry, AuditError, AuditSink};

/// Inserts one entry using any executor, so staffing mutations can write
/// their entry inside their own transaction.
pub(super) async fn insert_entry<'e, E>(executor: E, entry: &AuditEntry) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_log (
            audit_id,
            occurred_at,
            actor_type,
            actor_id,
            action,
            entity_type,
            entity_id,
            reason,
            before_state,
            after_state,
            request_id,
            attempt
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(entry.id.to_string())
    .bind(entry.occurred_at)
    .bind(entry.actor_type.to_string())
    .bind(&entry.actor_id)
    .bind(entry.action.as_str())
    .bind(&entry.entity_type)
    .bind(&entry.entity_id)
    .bind(entry.reason.as_deref())
    .bind(entry.before.as_ref())
    .bind(entry.after.as_ref())
    .bind(entry.request_id.as_deref())
    .bind(entry.attempt.map(|a| a as i32))
    .execute(executor)
    .await?;
    Ok(())
}

/// Append-only audit table. Updates and deletes are rejected by table rules.
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        insert_entry(&self.pool, &entry)
            .await
            .map_err(|e| AuditError::Storage(e.to_string()))
    }
}
