//! Job scheduler worker.
//!
//! Polls the [`JobStore`] at a fixed interval and runs claimed jobs on a
//! bounded set of tasks. Each job attempt is raced against a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lotacao_events::ActorType;
use lotacao_id::JobId;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{error, info, instrument, warn};

use super::{ExecutionError, Job, JobError, JobHandler, JobStatus, JobStore, NewJob};
use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::notify::{Notification, Notifier};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    /// Backoff between attempts of the same job. Only the delays are used;
    /// the attempt budget is each job's `max_attempts`.
    pub backoff: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            backoff: RetryPolicy {
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
                ..RetryPolicy::default()
            },
        }
    }
}

#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            handler,
            audit,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Queues a job and audits its creation.
    pub async fn submit(
        &self,
        job: NewJob,
        actor_type: ActorType,
        actor_id: &str,
    ) -> Result<Job, JobError> {
        let job = self.store.create(job).await?;
        info!(job_id = %job.id, kind = %job.kind, priority = job.priority, "Job queued");
        audit::record(
            self.audit.as_ref(),
            AuditEntry::new(AuditAction::JobCreated, "job", job.id.to_string())
                .actor(actor_type, actor_id)
                .after(serde_json::to_value(&job.payload).unwrap_or_default()),
        )
        .await;
        Ok(job)
    }

    /// Cancels a job that has not started.
    pub async fn cancel(
        &self,
        id: JobId,
        actor_type: ActorType,
        actor_id: &str,
    ) -> Result<Job, JobError> {
        let job = self.store.cancel(id, Utc::now()).await?;
        info!(job_id = %id, "Job cancelled");
        audit::record(
            self.audit.as_ref(),
            AuditEntry::new(AuditAction::JobCancelled, "job", id.to_string())
                .actor(actor_type, actor_id),
        )
        .await;
        Ok(job)
    }

    /// Run the scheduler until shutdown is signaled. In-flight jobs are
    /// awaited before returning.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent = self.config.max_concurrent,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting job scheduler"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        let mut running = JoinSet::new();
        let mut in_flight = HashMap::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    while let Some(joined) = running.try_join_next_with_id() {
                        self.reap(joined, &mut in_flight).await;
                    }
                    while running.len() < self.config.max_concurrent {
                        match self.store.claim_next(Utc::now()).await {
                            Ok(Some(job)) => self.spawn(&mut running, &mut in_flight, job),
                            Ok(None) => break,
                            Err(e) => {
                                error!(error = %e, "Failed to claim job");
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(in_flight = running.len(), "Job scheduler shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = running.join_next_with_id().await {
            self.reap(joined, &mut in_flight).await;
        }
    }

    /// Runs claimable jobs, up to `max_concurrent` at a time, until none is
    /// left. Returns the number of attempts executed.
    pub async fn run_pending(&self) -> usize {
        let mut executed = 0;
        let mut in_flight = HashMap::new();
        loop {
            let mut batch = JoinSet::new();
            while batch.len() < self.config.max_concurrent.max(1) {
                match self.store.claim_next(Utc::now()).await {
                    Ok(Some(job)) => self.spawn(&mut batch, &mut in_flight, job),
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to claim job");
                        break;
                    }
                }
            }
            if batch.is_empty() {
                return executed;
            }
            executed += batch.len();
            while let Some(joined) = batch.join_next_with_id().await {
                self.reap(joined, &mut in_flight).await;
            }
        }
    }

    fn spawn(&self, set: &mut JoinSet<()>, in_flight: &mut HashMap<task::Id, Job>, job: Job) {
        let scheduler = self.clone();
        let claimed = job.clone();
        let handle = set.spawn(async move { scheduler.execute(job).await });
        in_flight.insert(handle.id(), claimed);
    }

    /// Settles a finished task. A task that panicked never reached the
    /// store, so its job is failed here instead of staying `running`.
    async fn reap(
        &self,
        joined: Result<(task::Id, ()), JoinError>,
        in_flight: &mut HashMap<task::Id, Job>,
    ) {
        let err = match joined {
            Ok((id, ())) => {
                in_flight.remove(&id);
                return;
            }
            Err(err) => err,
        };
        let Some(job) = in_flight.remove(&err.id()) else {
            error!(error = %err, "Job task panicked");
            return;
        };
        error!(job_id = %job.id, kind = %job.kind, error = %err, "Job task panicked");
        self.record_failure(&job, ExecutionError::Panicked(err.to_string()))
            .await;
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind, attempt = job.attempts))]
    async fn execute(&self, job: Job) {
        let attempt = self.handler.execute(&job);
        let result = match tokio::time::timeout(self.config.job_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(self.config.job_timeout)),
        };

        match result {
            Ok(value) => self.finish(&job, value).await,
            Err(err) => self.record_failure(&job, err).await,
        }
    }

    async fn finish(&self, job: &Job, value: serde_json::Value) {
        match self.store.complete(job.id, value, Utc::now()).await {
            Ok(_) => {
                info!("Job completed");
                audit::record(
                    self.audit.as_ref(),
                    AuditEntry::new(AuditAction::JobCompleted, "job", job.id.to_string())
                        .attempt(job.attempts),
                )
                .await;
            }
            Err(e) => error!(error = %e, "Failed to mark job completed"),
        }
    }

    async fn record_failure(&self, job: &Job, err: ExecutionError) {
        let now = Utc::now();
        let retry_at = err.is_retryable().then(|| {
            let delay = chrono::Duration::from_std(self.config.backoff.delay_for(job.attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            now + delay
        });

        let updated = match self.store.fail(job.id, err.to_string(), retry_at, now).await {
            Ok(updated) => updated,
            Err(e) => {
                error!(error = %e, "Failed to record job failure");
                return;
            }
        };

        if updated.status == JobStatus::Pending {
            warn!(
                error = %err,
                run_after = %updated.run_after,
                "Job attempt failed, will retry"
            );
            audit::record(
                self.audit.as_ref(),
                AuditEntry::new(AuditAction::JobRetry, "job", job.id.to_string())
                    .reason(err.to_string())
                    .attempt(job.attempts),
            )
            .await;
            return;
        }

        error!(error = %err, attempts = updated.attempts, "Job failed permanently");
        audit::record(
            self.audit.as_ref(),
            AuditEntry::new(AuditAction::JobFailed, "job", job.id.to_string())
                .reason(err.to_string())
                .attempt(job.attempts),
        )
        .await;
        let notification = Notification::JobFailed {
            job_id: job.id,
            kind: job.kind,
            attempts: updated.attempts,
            error: err.to_string(),
        };
        if let Err(e) = self.notifier.send(notification).await {
            warn!(error = %e, "Failed to send job failure notification");
        }
    }
}
