//! Webhook gateway.
//!
//! Authenticates and validates HR deliveries, then drives them through the
//! pipeline: discrepancy check for admissions, retried application for
//! everything allowed, and a reprocessing job when transient retries run
//! out. Every outcome is shaped into the reply the HR system expects.

pub mod payload;
pub mod signature;

use std::sync::Arc;

use axum::http::StatusCode;
use lotacao_events::{ActorType, ColaboradorEvent, EventKind};
use lotacao_id::{JobId, ProposalId, WebhookEventId};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

pub use payload::FieldError;
pub use signature::{SignatureError, SIGNATURE_HEADER};

use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::inbox::WebhookEventStore;
use crate::jobs::{Job, JobError, JobPayload, JobScheduler, NewJob};
use crate::normalization::{ApplyContext, ApplyOutcome};
use crate::notify::{Notification, Notifier};
use crate::proposals::{Proposal, ProposalDraft, ProposalError, ProposalStore};
use crate::resolver::{DiscrepancyAction, DiscrepancyResolver};
use crate::retry::RetryCoordinator;

const HR_ACTOR: &str = "hr_system";

/// Body of every webhook reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WebhookReply {
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<DiscrepancyAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<ProposalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<WebhookEventId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub reply: WebhookReply,
}

impl WebhookResponse {
    fn new(status: StatusCode, reply: WebhookReply) -> Self {
        Self { status, reply }
    }

    fn rejected(status: StatusCode, error: impl Into<String>) -> Self {
        Self::new(
            status,
            WebhookReply {
                error: Some(error.into()),
                ..Default::default()
            },
        )
    }

    fn unavailable(employee_id: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            WebhookReply {
                error: Some("Service temporarily unavailable".to_string()),
                employee_id: Some(employee_id.to_string()),
                ..Default::default()
            },
        )
    }
}

fn processed_message(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Admission => "Employee admission processed",
        EventKind::Transfer => "Employee transfer processed",
        EventKind::Termination => "Employee termination processed",
        EventKind::Promotion => "Employee promotion processed",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error(transparent)]
    Job(#[from] JobError),
}

/// Collaborators the gateway drives.
#[derive(Clone)]
pub struct GatewayDeps {
    pub resolver: DiscrepancyResolver,
    pub coordinator: RetryCoordinator,
    pub webhooks: Arc<dyn WebhookEventStore>,
    pub proposals: Arc<dyn ProposalStore>,
    pub jobs: JobScheduler,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone)]
pub struct WebhookGateway {
    secret: Arc<[u8]>,
    reprocess_max_attempts: u32,
    deps: GatewayDeps,
}

impl WebhookGateway {
    pub fn new(secret: &[u8], reprocess_max_attempts: u32, deps: GatewayDeps) -> Self {
        Self {
            secret: Arc::from(secret),
            reprocess_max_attempts,
            deps,
        }
    }

    /// Handles one delivery to the endpoint for `kind`.
    #[instrument(skip(self, signature, body, request_id), fields(kind = %kind))]
    pub async fn handle(
        &self,
        kind: EventKind,
        signature: Option<&str>,
        body: &[u8],
        request_id: Option<String>,
    ) -> WebhookResponse {
        if let Err(e) = signature::verify(&self.secret, signature, body) {
            warn!(error = %e, "Rejected webhook signature");
            self.audit(
                AuditEntry::new(AuditAction::SignatureRejected, "webhook", kind.event_type())
                    .actor(ActorType::HrSystem, HR_ACTOR)
                    .reason(e.to_string())
                    .request_id(request_id),
            )
            .await;
            return WebhookResponse::rejected(StatusCode::UNAUTHORIZED, "Invalid webhook signature");
        }

        let (event, document) = match payload::parse_event(kind, body) {
            Ok(parsed) => parsed,
            Err(details) => {
                warn!(errors = details.len(), "Rejected webhook payload");
                self.audit(
                    AuditEntry::new(AuditAction::PayloadRejected, "webhook", kind.event_type())
                        .actor(ActorType::HrSystem, HR_ACTOR)
                        .reason(payload::describe(&details))
                        .request_id(request_id),
                )
                .await;
                return WebhookResponse::new(
                    StatusCode::BAD_REQUEST,
                    WebhookReply {
                        error: Some("Invalid payload".to_string()),
                        details: Some(details),
                        ..Default::default()
                    },
                );
            }
        };

        let stored = match self
            .deps
            .webhooks
            .store(kind, &event.employee_id, &document)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, employee_id = %event.employee_id, "Failed to store webhook");
                return WebhookResponse::unavailable(&event.employee_id);
            }
        };

        let ctx = ApplyContext::new(ActorType::HrSystem, HR_ACTOR)
            .with_request_id(request_id)
            .with_webhook_event(stored.id);

        if kind == EventKind::Admission {
            if let Some(response) = self.check_discrepancy(&event, &ctx, stored.id).await {
                return response;
            }
        }

        self.apply(&event, &ctx, stored.id).await
    }

    /// Returns a response when the admission must not be applied now.
    async fn check_discrepancy(
        &self,
        event: &ColaboradorEvent,
        ctx: &ApplyContext,
        event_id: WebhookEventId,
    ) -> Option<WebhookResponse> {
        match self.deps.resolver.is_duplicate(event).await {
            Ok(true) => {
                debug!(employee_id = %event.employee_id, "Admission already applied, skipping discrepancy check");
                return None;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "Processed-event ledger unavailable");
                return Some(WebhookResponse::unavailable(&event.employee_id));
            }
        }

        let decision = match self.deps.resolver.resolve(event).await {
            Ok(decision) => decision,
            Err(e) if e.is_transient() => {
                error!(error = %e, "Discrepancy check unavailable");
                return Some(WebhookResponse::unavailable(&event.employee_id));
            }
            Err(e) => {
                error!(kind = "data_integrity", error = %e, "Discrepancy check failed");
                return Some(integrity_response(&event.employee_id, e.to_string()));
            }
        };

        let entry = |action| {
            AuditEntry::new(action, "employee", &event.employee_id)
                .actor(ctx.actor_type, &ctx.actor_id)
                .reason(format!("{}: {}", decision.mismatch, decision.reason))
                .request_id(ctx.request_id.clone())
        };

        match decision.action {
            DiscrepancyAction::Allow => {
                self.audit(entry(AuditAction::DiscrepancyAllowed)).await;
                None
            }
            DiscrepancyAction::Block => {
                info!(employee_id = %event.employee_id, mismatch = %decision.mismatch, "Admission blocked");
                self.audit(entry(AuditAction::DiscrepancyBlocked)).await;
                Some(WebhookResponse::new(
                    StatusCode::CONFLICT,
                    WebhookReply {
                        error: Some("Cargo discrepancy detected".to_string()),
                        message: Some(decision.reason.clone()),
                        action: Some(DiscrepancyAction::Block),
                        employee_id: Some(event.employee_id.clone()),
                        event_id: Some(event_id),
                        ..Default::default()
                    },
                ))
            }
            DiscrepancyAction::RequireApproval => {
                let dedup_key = event.dedup_key();
                match self.deps.proposals.find_pending(&dedup_key).await {
                    Ok(Some(existing)) => {
                        info!(
                            employee_id = %event.employee_id,
                            proposal_id = %existing.id,
                            "Admission already awaiting approval"
                        );
                        self.audit(
                            entry(AuditAction::DuplicateSuppressed)
                                .after(serde_json::json!({ "proposal_id": existing.id })),
                        )
                        .await;
                        return Some(approval_required(event, &decision.reason, existing.id, event_id));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "Failed to look up pending proposal");
                        return Some(WebhookResponse::unavailable(&event.employee_id));
                    }
                }

                let draft = ProposalDraft {
                    webhook_event_id: event_id,
                    dedup_key,
                    employee_id: event.employee_id.clone(),
                    role_id: event.role_id.clone(),
                    cost_center_id: event.cost_center_id.clone(),
                    position_id: event.position_id.clone(),
                    mismatch: decision.mismatch,
                    reason: decision.reason.clone(),
                };
                let proposal = match self.deps.proposals.create(draft).await {
                    Ok(proposal) => proposal,
                    Err(e) => {
                        error!(error = %e, "Failed to create proposal");
                        return Some(WebhookResponse::unavailable(&event.employee_id));
                    }
                };
                info!(
                    employee_id = %event.employee_id,
                    proposal_id = %proposal.id,
                    mismatch = %decision.mismatch,
                    "Admission deferred for approval"
                );
                self.audit(
                    entry(AuditAction::ApprovalRequired)
                        .after(serde_json::json!({ "proposal_id": proposal.id })),
                )
                .await;
                self.notify(Notification::ProposalCreated {
                    proposal_id: proposal.id,
                    employee_id: event.employee_id.clone(),
                    reason: decision.reason.clone(),
                })
                .await;
                Some(approval_required(event, &decision.reason, proposal.id, event_id))
            }
        }
    }

    async fn apply(
        &self,
        event: &ColaboradorEvent,
        ctx: &ApplyContext,
        event_id: WebhookEventId,
    ) -> WebhookResponse {
        let employee_id = event.employee_id.clone();
        match self.deps.coordinator.run(event, ctx).await {
            Ok(outcome) => {
                let duplicate = outcome == ApplyOutcome::AlreadyApplied;
                let message = if duplicate {
                    "Event already processed"
                } else {
                    processed_message(event.kind())
                };
                WebhookResponse::new(
                    StatusCode::OK,
                    WebhookReply {
                        acknowledged: true,
                        message: Some(message.to_string()),
                        employee_id: Some(employee_id),
                        event_id: Some(event_id),
                        duplicate,
                        ..Default::default()
                    },
                )
            }
            Err(e) if e.is_transient() => {
                let job = NewJob::new(
                    JobPayload::WebhookRetry {
                        event_id,
                        proposal_id: None,
                    },
                    self.reprocess_max_attempts,
                );
                match self.deps.jobs.submit(job, ActorType::System, "gateway").await {
                    Ok(job) => {
                        info!(employee_id = %employee_id, job_id = %job.id, "Event queued for reprocessing");
                        WebhookResponse::new(
                            StatusCode::ACCEPTED,
                            WebhookReply {
                                acknowledged: true,
                                message: Some("Event queued for reprocessing".to_string()),
                                employee_id: Some(employee_id),
                                job_id: Some(job.id),
                                event_id: Some(event_id),
                                ..Default::default()
                            },
                        )
                    }
                    Err(job_err) => {
                        error!(error = %job_err, "Failed to queue reprocessing job");
                        WebhookResponse::unavailable(&employee_id)
                    }
                }
            }
            Err(e) => integrity_response(&employee_id, e.to_string()),
        }
    }

    /// Records the final decision on a proposal. Approval queues a job that
    /// applies the deferred event.
    #[instrument(skip(self))]
    pub async fn decide_proposal(
        &self,
        id: ProposalId,
        approved: bool,
        reviewer: &str,
    ) -> Result<(Proposal, Option<Job>), ApprovalError> {
        let proposal = self.deps.proposals.decide(id, approved, reviewer).await?;
        self.audit(
            AuditEntry::new(AuditAction::ProposalDecided, "proposal", id.to_string())
                .actor(ActorType::Operator, reviewer)
                .reason(proposal.status.as_str())
                .after(serde_json::to_value(&proposal).unwrap_or_default()),
        )
        .await;

        if !approved {
            info!(proposal_id = %id, "Proposal rejected");
            return Ok((proposal, None));
        }

        let job = NewJob::new(
            JobPayload::WebhookRetry {
                event_id: proposal.webhook_event_id,
                proposal_id: Some(id),
            },
            self.reprocess_max_attempts,
        );
        let job = self.deps.jobs.submit(job, ActorType::Operator, reviewer).await?;
        info!(proposal_id = %id, job_id = %job.id, "Proposal approved, deferred event queued");
        Ok((proposal, Some(job)))
    }

    async fn audit(&self, entry: AuditEntry) {
        audit::record(self.deps.audit.as_ref(), entry).await;
    }

    async fn notify(&self, notification: Notification) {
        if let Err(e) = self.deps.notifier.send(notification).await {
            warn!(error = %e, "Failed to send notification");
        }
    }
}

fn integrity_response(employee_id: &str, message: String) -> WebhookResponse {
    WebhookResponse::new(
        StatusCode::UNPROCESSABLE_ENTITY,
        WebhookReply {
            error: Some("Staffing data integrity error".to_string()),
            message: Some(message),
            employee_id: Some(employee_id.to_string()),
            ..Default::default()
        },
    )
}

fn approval_required(
    event: &ColaboradorEvent,
    reason: &str,
    proposal_id: ProposalId,
    event_id: WebhookEventId,
) -> WebhookResponse {
    WebhookResponse::new(
        StatusCode::CONFLICT,
        WebhookReply {
            error: Some("Cargo discrepancy detected".to_string()),
            message: Some(reason.to_string()),
            action: Some(DiscrepancyAction::RequireApproval),
            employee_id: Some(event.employee_id.clone()),
            proposal_id: Some(proposal_id),
            event_id: Some(event_id),
            ..Default::default()
        },
    )
}
