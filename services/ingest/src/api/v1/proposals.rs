//! Proposal approval callback.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use lotacao_id::ProposalId;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::gateway::ApprovalError;
use crate::jobs::{Job, JobError};
use crate::proposals::{Proposal, ProposalError};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/proposals/{proposal_id}/approval", post(decide_proposal))
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub approved: bool,
    pub reviewer: String,
}

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub proposal: Proposal,
    /// Job applying the deferred event, when approved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
}

/// POST /v1/proposals/{proposal_id}/approval
async fn decide_proposal(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(proposal_id): Path<String>,
    Json(req): Json<ApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = ProposalId::parse(&proposal_id).map_err(|e| {
        ApiError::bad_request("invalid_proposal_id", "proposal_id is not a valid proposal id")
            .with_details(vec![FieldError::new("proposal_id", e.to_string())])
            .with_request_id(ctx.request_id.clone())
    })?;

    let reviewer = req.reviewer.trim();
    if reviewer.is_empty() {
        return Err(
            ApiError::bad_request("invalid_reviewer", "reviewer cannot be empty")
                .with_details(vec![FieldError::new("reviewer", "must not be empty")])
                .with_request_id(ctx.request_id),
        );
    }

    let (proposal, job) = state
        .gateway()
        .decide_proposal(id, req.approved, reviewer)
        .await
        .map_err(|e| approval_error(e, &ctx.request_id))?;

    Ok(Json(ApprovalResponse { proposal, job }))
}

fn approval_error(err: ApprovalError, request_id: &str) -> ApiError {
    let api_error = match &err {
        ApprovalError::Proposal(ProposalError::NotFound(_)) => {
            ApiError::not_found("proposal_not_found", err.to_string())
        }
        ApprovalError::Proposal(ProposalError::AlreadyDecided { .. }) => {
            ApiError::conflict("proposal_already_decided", err.to_string())
        }
        ApprovalError::Proposal(ProposalError::Storage(_)) => {
            error!(error = %err, request_id = %request_id, "Failed to record proposal decision");
            ApiError::service_unavailable("storage_unavailable", "Proposal storage unavailable")
        }
        ApprovalError::Job(JobError::NotFound(_) | JobError::InvalidTransition { .. }) => {
            error!(error = %err, request_id = %request_id, "Failed to queue approved proposal");
            ApiError::internal("job_submit_failed", "Failed to queue the approved change")
        }
    };
    api_error.with_request_id(request_id.to_string())
}
