//! Append-only audit trail.
//!
//! Every decision point in the pipeline records an [`AuditEntry`]: signature
//! and schema rejections, discrepancy decisions, each retry attempt, applied
//! mutations, and job state changes. Entries are never updated or deleted.
//!
//! Mutation entries are written by the staffing store inside the same
//! transaction as the mutation itself; everything else goes through an
//! [`AuditSink`].

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotacao_events::ActorType;
use lotacao_id::AuditId;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SignatureRejected,
    PayloadRejected,
    DiscrepancyAllowed,
    DiscrepancyBlocked,
    ApprovalRequired,
    ProposalDecided,
    EventApplied,
    DuplicateSuppressed,
    ApplyRetry,
    ApplyFailed,
    IntegrityFailure,
    RowUpdated,
    BulkNormalization,
    JobCreated,
    JobRetry,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SignatureRejected => "signature_rejected",
            AuditAction::PayloadRejected => "payload_rejected",
            AuditAction::DiscrepancyAllowed => "discrepancy_allowed",
            AuditAction::DiscrepancyBlocked => "discrepancy_blocked",
            AuditAction::ApprovalRequired => "approval_required",
            AuditAction::ProposalDecided => "proposal_decided",
            AuditAction::EventApplied => "event_applied",
            AuditAction::DuplicateSuppressed => "duplicate_suppressed",
            AuditAction::ApplyRetry => "apply_retry",
            AuditAction::ApplyFailed => "apply_failed",
            AuditAction::IntegrityFailure => "integrity_failure",
            AuditAction::RowUpdated => "row_updated",
            AuditAction::BulkNormalization => "bulk_normalization",
            AuditAction::JobCreated => "job_created",
            AuditAction::JobRetry => "job_retry",
            AuditAction::JobCompleted => "job_completed",
            AuditAction::JobFailed => "job_failed",
            AuditAction::JobCancelled => "job_cancelled",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record: who, when, why, and the state before and after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub occurred_at: DateTime<Utc>,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub action: AuditAction,
    /// Kind of record the entry is about (`employee`, `job`, `staffing_row`...).
    pub entity_type: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl AuditEntry {
    /// Starts an entry attributed to the system actor.
    pub fn new(
        action: AuditAction,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: AuditId::new(),
            occurred_at: Utc::now(),
            actor_type: ActorType::System,
            actor_id: "system".to_string(),
            action,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            reason: None,
            before: None,
            after: None,
            request_id: None,
            attempt: None,
        }
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id.into();
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn before(mut self, before: serde_json::Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn after(mut self, after: serde_json::Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Audit write errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),
}

/// Append-only destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Records an entry, logging instead of failing the caller when the sink is
/// unavailable.
pub async fn record(sink: &dyn AuditSink, entry: AuditEntry) {
    let action = entry.action;
    let entity_id = entry.entity_id.clone();
    if let Err(e) = sink.record(entry).await {
        warn!(error = %e, action = %action, entity_id = %entity_id, "Failed to write audit entry");
    }
}

/// In-process audit log.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends synchronously. Used by the in-memory staffing store while it
    /// holds its own lock, so the entry lands together with the mutation.
    pub fn append(&self, entry: AuditEntry) {
        self.lock().push(entry);
    }

    /// Snapshot of all entries in insertion order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.lock().iter().filter(|e| e.action == action).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditEntry>> {
        // Entries are plain data; a poisoned lock still holds a usable log.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.append(entry);
        Ok(())
    }
}
