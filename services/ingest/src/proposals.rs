//! Change proposals raised by the discrepancy resolver.
//!
//! The approval workflow itself (levels, reviewers, UI) is external. This
//! module only creates proposals and records their final decision; an
//! approved proposal is what releases the deferred staffing mutation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotacao_id::{ProposalId, WebhookEventId};
use serde::{Deserialize, Serialize};

use crate::resolver::MismatchKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProposalStatus::Pending),
            "approved" => Some(ProposalStatus::Approved),
            "rejected" => Some(ProposalStatus::Rejected),
            _ => None,
        }
    }
}

/// Input for a new proposal.
#[derive(Debug, Clone)]
pub struct ProposalDraft {
    pub webhook_event_id: WebhookEventId,
    /// Ledger key of the deferred event; redeliveries share it.
    pub dedup_key: String,
    pub employee_id: String,
    pub role_id: String,
    pub cost_center_id: String,
    pub position_id: Option<String>,
    pub mismatch: MismatchKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub webhook_event_id: WebhookEventId,
    pub dedup_key: String,
    pub employee_id: String,
    pub role_id: String,
    pub cost_center_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    pub mismatch: MismatchKind,
    pub reason: String,
    pub status: ProposalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("proposal not found: {0}")]
    NotFound(ProposalId),

    #[error("proposal {id} was already {status}")]
    AlreadyDecided {
        id: ProposalId,
        status: &'static str,
    },

    #[error("proposal storage error: {0}")]
    Storage(String),
}

impl From<crate::db::DbError> for ProposalError {
    fn from(err: crate::db::DbError) -> Self {
        ProposalError::Storage(err.to_string())
    }
}

#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn create(&self, draft: ProposalDraft) -> Result<Proposal, ProposalError>;

    async fn get(&self, id: ProposalId) -> Result<Option<Proposal>, ProposalError>;

    /// The pending proposal already raised for the event with `dedup_key`.
    async fn find_pending(&self, dedup_key: &str) -> Result<Option<Proposal>, ProposalError>;

    async fn list_pending(&self) -> Result<Vec<Proposal>, ProposalError>;

    /// Records the final decision. Only pending proposals can be decided.
    async fn decide(
        &self,
        id: ProposalId,
        approved: bool,
        reviewer: &str,
    ) -> Result<Proposal, ProposalError>;
}

#[derive(Default)]
pub struct MemoryProposalStore {
    proposals: Mutex<HashMap<ProposalId, Proposal>>,
}

impl MemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Proposal> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProposalId, Proposal>> {
        self.proposals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProposalStore for MemoryProposalStore {
    async fn create(&self, draft: ProposalDraft) -> Result<Proposal, ProposalError> {
        let proposal = Proposal {
            id: ProposalId::new(),
            webhook_event_id: draft.webhook_event_id,
            dedup_key: draft.dedup_key,
            employee_id: draft.employee_id,
            role_id: draft.role_id,
            cost_center_id: draft.cost_center_id,
            position_id: draft.position_id,
            mismatch: draft.mismatch,
            reason: draft.reason,
            status: ProposalStatus::Pending,
            reviewer: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        self.lock().insert(proposal.id, proposal.clone());
        Ok(proposal)
    }

    async fn get(&self, id: ProposalId) -> Result<Option<Proposal>, ProposalError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn find_pending(&self, dedup_key: &str) -> Result<Option<Proposal>, ProposalError> {
        Ok(self
            .lock()
            .values()
            .find(|p| p.status == ProposalStatus::Pending && p.dedup_key == dedup_key)
            .cloned())
    }

    async fn list_pending(&self) -> Result<Vec<Proposal>, ProposalError> {
        let mut pending: Vec<Proposal> = self
            .lock()
            .values()
            .filter(|p| p.status == ProposalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        Ok(pending)
    }

    async fn decide(
        &self,
        id: ProposalId,
        approved: bool,
        reviewer: &str,
    ) -> Result<Proposal, ProposalError> {
        let mut proposals = self.lock();
        let proposal = proposals.get_mut(&id).ok_or(ProposalError::NotFound(id))?;
        if proposal.status != ProposalStatus::Pending {
            return Err(ProposalError::AlreadyDecided {
                id,
                status: proposal.status.as_str(),
            });
        }
        proposal.status = if approved {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        };
        proposal.reviewer = Some(reviewer.to_string());
        proposal.decided_at = Some(Utc::now());
        Ok(proposal.clone())
    }
}
