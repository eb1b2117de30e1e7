//! Runs one job attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lotacao_events::{ActorType, ColaboradorEvent, EventKind};
use lotacao_id::{ProposalId, WebhookEventId};
use serde_json::json;
use tracing::{info, warn};

use super::{Job, JobPayload};
use crate::gateway::payload;
use crate::inbox::{InboxError, WebhookEventStore};
use crate::normalization::{ApplyContext, ApplyOutcome, NormalizationEngine, NormalizationError};
use crate::resolver::{DiscrepancyAction, DiscrepancyResolver, MismatchKind};
use crate::retry::RetryCoordinator;
use crate::staffing::StaffingError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error("stored webhook not found: {0}")]
    MissingWebhook(WebhookEventId),

    #[error("stored webhook {id} does not validate: {details}")]
    InvalidPayload { id: WebhookEventId, details: String },

    /// The admission policy does not allow the stored admission without an
    /// approved proposal.
    #[error("admission {id} not allowed ({action}, {mismatch}): {reason}")]
    NotAllowed {
        id: WebhookEventId,
        action: &'static str,
        mismatch: MismatchKind,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("job task panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Normalization(e) => e.is_transient(),
            ExecutionError::Storage(_) | ExecutionError::Timeout(_) => true,
            ExecutionError::MissingWebhook(_)
            | ExecutionError::InvalidPayload { .. }
            | ExecutionError::NotAllowed { .. }
            | ExecutionError::Panicked(_) => false,
        }
    }
}

impl From<InboxError> for ExecutionError {
    fn from(err: InboxError) -> Self {
        ExecutionError::Storage(err.to_string())
    }
}

/// Executes a claimed job and returns its result document.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, ExecutionError>;
}

pub struct JobExecutor {
    engine: NormalizationEngine,
    coordinator: RetryCoordinator,
    resolver: DiscrepancyResolver,
    webhooks: Arc<dyn WebhookEventStore>,
}

impl JobExecutor {
    pub fn new(
        engine: NormalizationEngine,
        coordinator: RetryCoordinator,
        resolver: DiscrepancyResolver,
        webhooks: Arc<dyn WebhookEventStore>,
    ) -> Self {
        Self {
            engine,
            coordinator,
            resolver,
            webhooks,
        }
    }

    /// Admissions without an approved proposal go through the admission
    /// policy again, against the current plan.
    async fn check_admission(
        &self,
        event: &ColaboradorEvent,
        event_id: WebhookEventId,
    ) -> Result<(), ExecutionError> {
        let to_exec = |e: StaffingError| ExecutionError::Normalization(e.into());
        if self.resolver.is_duplicate(event).await.map_err(to_exec)? {
            return Ok(());
        }
        let decision = self.resolver.resolve(event).await.map_err(to_exec)?;
        if decision.action == DiscrepancyAction::Allow {
            return Ok(());
        }
        warn!(
            event_id = %event_id,
            employee_id = %event.employee_id,
            mismatch = %decision.mismatch,
            action = decision.action.as_str(),
            "Reprocessing refused by admission policy"
        );
        Err(ExecutionError::NotAllowed {
            id: event_id,
            action: decision.action.as_str(),
            mismatch: decision.mismatch,
            reason: decision.reason,
        })
    }

    /// Rebuilds the stored event and applies it once. The job's own attempt
    /// budget bounds the total number of applies.
    async fn reprocess(
        &self,
        job: &Job,
        event_id: WebhookEventId,
        proposal_id: Option<ProposalId>,
    ) -> Result<serde_json::Value, ExecutionError> {
        let stored = self
            .webhooks
            .get(event_id)
            .await?
            .ok_or(ExecutionError::MissingWebhook(event_id))?;
        let event = payload::parse_event_value(stored.kind, &stored.payload).map_err(|errors| {
            ExecutionError::InvalidPayload {
                id: event_id,
                details: payload::describe(&errors),
            }
        })?;

        if stored.kind == EventKind::Admission && proposal_id.is_none() {
            self.check_admission(&event, event_id).await?;
        }

        let ctx = ApplyContext {
            attempt: job.attempts,
            ..ApplyContext::new(ActorType::System, "scheduler").with_webhook_event(event_id)
        };
        let policy = self.coordinator.policy().single_attempt();
        let outcome = self.coordinator.run_with_policy(&event, &ctx, policy).await?;

        let (status, deltas) = match outcome {
            ApplyOutcome::Applied { deltas } => ("applied", deltas),
            ApplyOutcome::AlreadyApplied => ("already_applied", Vec::new()),
        };
        info!(
            job_id = %job.id,
            event_id = %event_id,
            employee_id = %event.employee_id,
            status,
            "Stored webhook reprocessed"
        );
        Ok(json!({
            "event_id": event_id,
            "employee_id": event.employee_id,
            "status": status,
            "deltas": deltas,
        }))
    }
}

#[async_trait]
impl JobHandler for JobExecutor {
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, ExecutionError> {
        match &job.payload {
            JobPayload::BulkNormalization(scope) => {
                let summary = self.engine.renormalize(scope).await?;
                serde_json::to_value(summary).map_err(|e| ExecutionError::Storage(e.to_string()))
            }
            JobPayload::WebhookRetry {
                event_id,
                proposal_id,
            } => self.reprocess(job, *event_id, *proposal_id).await,
        }
    }
}
