//! In-process job registry behind a single async mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotacao_id::JobId;
use tokio::sync::Mutex;

use super::{Job, JobError, JobStatus, JobStore, NewJob};

/// Jobs are kept in creation order.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn transition<'a>(
    jobs: &'a mut [Job],
    id: JobId,
    from: JobStatus,
    action: &'static str,
) -> Result<&'a mut Job, JobError> {
    let job = jobs
        .iter_mut()
        .find(|j| j.id == id)
        .ok_or(JobError::NotFound(id))?;
    if job.status != from {
        return Err(JobError::InvalidTransition {
            id,
            status: job.status,
            action,
        });
    }
    Ok(job)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            kind: new.payload.kind(),
            status: JobStatus::Pending,
            priority: new.priority,
            payload: new.payload,
            attempts: 0,
            max_attempts: new.max_attempts.max(1),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            run_after: now,
            error: None,
            result: None,
        };
        self.jobs.lock().await.push(job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, JobError> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobError> {
        let mut jobs = self.jobs.lock().await;
        // min_by keeps the first of equal elements, so ties go to the older job.
        let next = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && j.run_after <= now)
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = transition(&mut jobs, id, JobStatus::Pending, "start")?;
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = transition(&mut jobs, id, JobStatus::Running, "complete")?;
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.error = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn fail(
        &self,
        id: JobId,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = transition(&mut jobs, id, JobStatus::Running, "fail")?;
        job.error = Some(error);
        job.updated_at = now;
        match retry_at {
            Some(retry_at) if job.attempts < job.max_attempts => {
                job.status = JobStatus::Pending;
                job.run_after = retry_at;
            }
            _ => {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            }
        }
        Ok(job.clone())
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = transition(&mut jobs, id, JobStatus::Pending, "cancel")?;
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, JobError> {
        let mut jobs = self.jobs.lock().await;
        let len = jobs.len();
        jobs.retain(|j| {
            !(j.status.is_terminal() && j.finished_at.is_some_and(|finished| finished < cutoff))
        });
        Ok((len - jobs.len()) as u64)
    }
}
