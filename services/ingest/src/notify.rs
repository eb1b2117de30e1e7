//! Outbound notifications.
//!
//! Delivery transport (email, SMS, in-app) is owned by another service. The
//! pipeline emits two notifications: a proposal awaiting approval, and a job
//! that failed permanently.

use std::sync::Mutex;

use async_trait::async_trait;
use lotacao_id::{JobId, ProposalId};
use serde::Serialize;
use tracing::info;

use crate::jobs::JobKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ProposalCreated {
        proposal_id: ProposalId,
        employee_id: String,
        reason: String,
    },
    JobFailed {
        job_id: JobId,
        kind: JobKind,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the structured log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError> {
        match &notification {
            Notification::ProposalCreated {
                proposal_id,
                employee_id,
                reason,
            } => info!(
                proposal_id = %proposal_id,
                employee_id = %employee_id,
                reason = %reason,
                "Proposal awaiting approval"
            ),
            Notification::JobFailed {
                job_id,
                kind,
                attempts,
                error,
            } => info!(
                job_id = %job_id,
                kind = %kind,
                attempts = attempts,
                error = %error,
                "Job failed permanently"
            ),
        }
        Ok(())
    }
}

/// Keeps sent notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
        Ok(())
    }
}
