//! Job administration endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use lotacao_id::{JobId, WebhookEventId};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::inbox::WebhookEventStore;
use crate::jobs::{Job, JobError, JobPayload, JobStatus, JobStore, NewJob};
use crate::normalization::NormalizationScope;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/reprocess", post(create_reprocess_job))
        .route("/jobs/normalize", post(create_normalize_job))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ReprocessRequest {
    /// Stored webhook delivery to apply again.
    pub event_id: String,
    pub max_attempts: Option<u32>,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct NormalizeRequest {
    pub plan_id: Option<String>,
    pub cost_center_ids: Option<Vec<String>>,
    pub hired_from: Option<NaiveDate>,
    pub hired_to: Option<NaiveDate>,
    pub max_attempts: Option<u32>,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<Job>,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/jobs/reprocess
async fn create_reprocess_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<ReprocessRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let event_id = WebhookEventId::parse(&req.event_id).map_err(|e| {
        ApiError::bad_request("invalid_event_id", "event_id is not a valid webhook event id")
            .with_details(vec![FieldError::new("event_id", e.to_string())])
            .with_request_id(ctx.request_id.clone())
    })?;

    let stored = state
        .stores()
        .webhooks
        .get(event_id)
        .await
        .map_err(|e| {
            error!(error = %e, request_id = %ctx.request_id, "Failed to load webhook");
            ApiError::service_unavailable("storage_unavailable", "Webhook storage unavailable")
                .with_request_id(ctx.request_id.clone())
        })?;
    if stored.is_none() {
        return Err(ApiError::not_found(
            "event_not_found",
            format!("Webhook event {event_id} not found"),
        )
        .with_request_id(ctx.request_id));
    }

    let job = NewJob::new(
        JobPayload::WebhookRetry {
            event_id,
            proposal_id: None,
        },
        req.max_attempts.unwrap_or(state.job_max_attempts()),
    )
    .priority(req.priority.unwrap_or(0));

    submit(&state, &ctx, job).await
}

/// POST /v1/jobs/normalize
async fn create_normalize_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<NormalizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let (Some(from), Some(to)) = (req.hired_from, req.hired_to) {
        if from > to {
            return Err(ApiError::bad_request(
                "invalid_date_range",
                "hired_from must not be after hired_to",
            )
            .with_details(vec![FieldError::new("hired_from", "must not be after hired_to")])
            .with_request_id(ctx.request_id));
        }
    }

    let scope = NormalizationScope {
        plan_id: req.plan_id.filter(|p| !p.is_empty()),
        cost_center_ids: req.cost_center_ids.filter(|ids| !ids.is_empty()),
        hired_from: req.hired_from,
        hired_to: req.hired_to,
    };
    let job = NewJob::new(
        JobPayload::BulkNormalization(scope),
        req.max_attempts.unwrap_or(state.job_max_attempts()),
    )
    .priority(req.priority.unwrap_or(0));

    submit(&state, &ctx, job).await
}

async fn submit(
    state: &AppState,
    ctx: &RequestContext,
    job: NewJob,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state
        .scheduler()
        .submit(job, ctx.actor_type, &ctx.actor_id)
        .await
        .map_err(|e| job_error(e, &ctx.request_id))?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /v1/jobs
async fn list_jobs(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            ApiError::bad_request("invalid_status", format!("Unknown job status {raw:?}"))
                .with_request_id(ctx.request_id.clone())
        })?),
    };

    let items = state
        .scheduler()
        .store()
        .list(status)
        .await
        .map_err(|e| job_error(e, &ctx.request_id))?;
    Ok(Json(ListJobsResponse { items }))
}

/// GET /v1/jobs/{job_id}
async fn get_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&job_id, &ctx.request_id)?;
    let job = state
        .scheduler()
        .store()
        .get(id)
        .await
        .map_err(|e| job_error(e, &ctx.request_id))?
        .ok_or_else(|| job_error(JobError::NotFound(id), &ctx.request_id))?;
    Ok(Json(job))
}

/// POST /v1/jobs/{job_id}/cancel
async fn cancel_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&job_id, &ctx.request_id)?;
    let job = state
        .scheduler()
        .cancel(id, ctx.actor_type, &ctx.actor_id)
        .await
        .map_err(|e| job_error(e, &ctx.request_id))?;
    Ok(Json(job))
}

fn parse_job_id(raw: &str, request_id: &str) -> Result<JobId, ApiError> {
    JobId::parse(raw).map_err(|e| {
        ApiError::bad_request("invalid_job_id", "job_id is not a valid job id")
            .with_details(vec![FieldError::new("job_id", e.to_string())])
            .with_request_id(request_id.to_string())
    })
}

fn job_error(err: JobError, request_id: &str) -> ApiError {
    let api_error = match &err {
        JobError::NotFound(_) => ApiError::not_found("job_not_found", err.to_string()),
        JobError::InvalidTransition { .. } => {
            ApiError::conflict("job_not_pending", err.to_string())
        }
    };
    api_error.with_request_id(request_id.to_string())
}
