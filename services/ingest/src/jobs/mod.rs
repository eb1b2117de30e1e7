//! Background jobs: deferred and failed work.
//!
//! A job moves `pending -> running -> {completed | failed | cancelled}`; a
//! failed attempt goes back to `pending` behind a backoff gate while attempts
//! remain. Only pending jobs can be cancelled.

mod executor;
mod scheduler;
mod store;

pub use executor::{ExecutionError, JobExecutor, JobHandler};
pub use scheduler::{JobScheduler, SchedulerConfig};
pub use store::MemoryJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotacao_id::{JobId, ProposalId, WebhookEventId};
use serde::{Deserialize, Serialize};

use crate::normalization::NormalizationScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BulkNormalization,
    WebhookRetry,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::BulkNormalization => write!(f, "bulk_normalization"),
            JobKind::WebhookRetry => write!(f, "webhook_retry"),
        }
    }
}

/// What a job does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    BulkNormalization(NormalizationScope),

    /// Re-applies a stored webhook delivery. `proposal_id` is set when the
    /// job releases a mutation deferred for approval.
    WebhookRetry {
        event_id: WebhookEventId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proposal_id: Option<ProposalId>,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::BulkNormalization(_) => JobKind::BulkNormalization,
            JobPayload::WebhookRetry { .. } => JobKind::WebhookRetry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i32,
    pub payload: JobPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant.
    pub run_after: DateTime<Utc>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: JobPayload,
    pub priority: i32,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        Self {
            payload,
            priority: 0,
            max_attempts,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },
}

/// Job registry. Implementations serialize all writes.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: NewJob) -> Result<Job, JobError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobError>;

    /// Jobs in creation order, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, JobError>;

    /// Moves the highest-priority pending job whose gate has passed to
    /// `running` and counts the attempt. Ties go to the oldest job.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobError>;

    async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError>;

    /// Records a failed attempt. With `retry_at` set and attempts left the
    /// job returns to `pending` gated until `retry_at`; otherwise it is
    /// terminally `failed`.
    async fn fail(
        &self,
        id: JobId,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError>;

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobError>;

    /// Drops terminal jobs that finished before `cutoff`.
    async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, JobError>;
}
