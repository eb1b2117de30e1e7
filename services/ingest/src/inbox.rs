//! Stored webhook deliveries.
//!
//! Every delivery that passes signature and schema checks is kept, so a
//! reprocessing job or an approved proposal can rebuild the original event
//! without asking the HR system to resend it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotacao_events::EventKind;
use lotacao_id::WebhookEventId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredWebhook {
    pub id: WebhookEventId,
    pub kind: EventKind,
    pub employee_id: String,
    /// The validated payload exactly as delivered.
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("webhook storage error: {0}")]
    Storage(String),
}

impl From<crate::db::DbError> for InboxError {
    fn from(err: crate::db::DbError) -> Self {
        InboxError::Storage(err.to_string())
    }
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn store(
        &self,
        kind: EventKind,
        employee_id: &str,
        payload: &serde_json::Value,
    ) -> Result<StoredWebhook, InboxError>;

    async fn get(&self, id: WebhookEventId) -> Result<Option<StoredWebhook>, InboxError>;

    /// Drops deliveries received before `cutoff`. Deliveries listed in
    /// `retained` survive regardless of age; callers pass every delivery a
    /// pending proposal or an unfinished retry job still points at.
    async fn purge(
        &self,
        cutoff: DateTime<Utc>,
        retained: &[WebhookEventId],
    ) -> Result<u64, InboxError>;
}

#[derive(Default)]
pub struct MemoryWebhookEventStore {
    events: Mutex<HashMap<WebhookEventId, StoredWebhook>>,
}

impl MemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WebhookEventId, StoredWebhook>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WebhookEventStore for MemoryWebhookEventStore {
    async fn store(
        &self,
        kind: EventKind,
        employee_id: &str,
        payload: &serde_json::Value,
    ) -> Result<StoredWebhook, InboxError> {
        let stored = StoredWebhook {
            id: WebhookEventId::new(),
            kind,
            employee_id: employee_id.to_string(),
            payload: payload.clone(),
            received_at: Utc::now(),
        };
        self.lock().insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: WebhookEventId) -> Result<Option<StoredWebhook>, InboxError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn purge(
        &self,
        cutoff: DateTime<Utc>,
        retained: &[WebhookEventId],
    ) -> Result<u64, InboxError> {
        let mut events = self.lock();
        let len = events.len();
        events.retain(|id, e| e.received_at >= cutoff || retained.contains(id));
        Ok((len - events.len()) as u64)
    }
}
