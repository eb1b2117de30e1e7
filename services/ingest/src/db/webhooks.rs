//! Postgres storage for received webhook deliveries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotacao_events::EventKind;
use lotacao_id::WebhookEventId;
use sqlx::{postgres::PgPool, postgres::PgRow, Row};

use super::DbError;
use crate::inbox::{InboxError, StoredWebhook, WebhookEventStore};

impl<'r> sqlx::FromRow<'r, PgRow> for StoredWebhook {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("event_id")?;
        let kind: String = row.try_get("event_type")?;
        Ok(Self {
            id: WebhookEventId::parse(&id).map_err(|e| sqlx::Error::ColumnDecode {
                index: "event_id".to_string(),
                source: Box::new(e),
            })?,
            kind: EventKind::from_event_type(&kind).map_err(|e| sqlx::Error::ColumnDecode {
                index: "event_type".to_string(),
                source: Box::new(e),
            })?,
            employee_id: row.try_get("employee_id")?,
            payload: row.try_get("payload")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

#[derive(Clone)]
pub struct PgWebhookEventStore {
    pool: PgPool,
}

impl PgWebhookEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventStore for PgWebhookEventStore {
    async fn store(
        &self,
        kind: EventKind,
        employee_id: &str,
        payload: &serde_json::Value,
    ) -> Result<StoredWebhook, InboxError> {
        let stored = sqlx::query_as::<_, StoredWebhook>(
            r#"
            INSERT INTO webhook_events (event_id, event_type, employee_id, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING event_id, event_type, employee_id, payload, received_at
            "#,
        )
        .bind(WebhookEventId::new().to_string())
        .bind(kind.event_type())
        .bind(employee_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(stored)
    }

    async fn get(&self, id: WebhookEventId) -> Result<Option<StoredWebhook>, InboxError> {
        let stored = sqlx::query_as::<_, StoredWebhook>(
            r#"
            SELECT event_id, event_type, employee_id, payload, received_at
            FROM webhook_events
            WHERE event_id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(stored)
    }

    async fn purge(
        &self,
        cutoff: DateTime<Utc>,
        retained: &[WebhookEventId],
    ) -> Result<u64, InboxError> {
        let retained: Vec<String> = retained.iter().map(ToString::to_string).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events w
            WHERE w.received_at < $1
              AND NOT (w.event_id = ANY($2))
              AND NOT EXISTS (
                  SELECT 1 FROM proposals p
                  WHERE p.webhook_event_id = w.event_id
                    AND p.status = 'pending'
              )
            "#,
        )
        .bind(cutoff)
        .bind(&retained)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }
}
