use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use lotacao_id::WebhookEventId;

use crate::inbox::WebhookEventStore;
use crate::jobs::{JobPayload, JobStatus, JobStore};
use crate::proposals::ProposalStore;
use crate::staffing::StaffingRepository;

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
    /// How long completed, failed and cancelled jobs stay listable.
    pub job_retention: Duration,
    /// Dedup window of the processed-event ledger.
    pub ledger_retention_days: i64,
    pub webhook_retention_days: i64,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            job_retention: Duration::from_secs(24 * 3600),
            ledger_retention_days: 7,
            webhook_retention_days: 30,
        }
    }
}

pub struct CleanupWorker {
    staffing: StaffingRepository,
    jobs: Arc<dyn JobStore>,
    webhooks: Arc<dyn WebhookEventStore>,
    proposals: Arc<dyn ProposalStore>,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(
        staffing: StaffingRepository,
        jobs: Arc<dyn JobStore>,
        webhooks: Arc<dyn WebhookEventStore>,
        proposals: Arc<dyn ProposalStore>,
        config: CleanupWorkerConfig,
    ) -> Self {
        Self {
            staffing,
            jobs,
            webhooks,
            proposals,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            ledger_retention_days = self.config.ledger_retention_days,
            webhook_retention_days = self.config.webhook_retention_days,
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cleanup(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One cleanup pass relative to `now`. Returns the number of records
    /// removed.
    pub async fn run_cleanup(&self, now: DateTime<Utc>) -> u64 {
        let mut total_deleted = 0u64;

        let job_cutoff = now
            - chrono::Duration::from_std(self.config.job_retention)
                .unwrap_or_else(|_| chrono::Duration::zero());
        match self.jobs.purge_terminal(job_cutoff).await {
            Ok(count) => {
                if count > 0 {
                    info!(deleted = count, "Cleaned up finished jobs");
                }
                total_deleted += count;
            }
            Err(e) => {
                warn!(error = %e, "Failed to cleanup finished jobs");
            }
        }

        let ledger_cutoff = now - chrono::Duration::days(self.config.ledger_retention_days);
        match self.staffing.purge_processed_events(ledger_cutoff).await {
            Ok(count) => {
                if count > 0 {
                    info!(deleted = count, "Cleaned up expired processed-event keys");
                }
                total_deleted += count;
            }
            Err(e) => {
                error!(error = %e, "Failed to cleanup processed-event ledger");
            }
        }

        let webhook_cutoff = now - chrono::Duration::days(self.config.webhook_retention_days);
        match self.referenced_deliveries().await {
            Ok(retained) => match self.webhooks.purge(webhook_cutoff, &retained).await {
                Ok(count) => {
                    if count > 0 {
                        info!(
                            deleted = count,
                            retained = retained.len(),
                            "Cleaned up old webhook deliveries"
                        );
                    }
                    total_deleted += count;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to cleanup webhook deliveries");
                }
            },
            Err(e) => {
                warn!(error = %e, "Skipping webhook cleanup, references unavailable");
            }
        }

        if total_deleted > 0 {
            info!(total_deleted = total_deleted, "Cleanup pass complete");
        }
        total_deleted
    }

    /// Deliveries a pending proposal or an unfinished retry job still needs.
    async fn referenced_deliveries(&self) -> anyhow::Result<Vec<WebhookEventId>> {
        let mut retained: Vec<WebhookEventId> = self
            .proposals
            .list_pending()
            .await?
            .into_iter()
            .map(|p| p.webhook_event_id)
            .collect();

        for status in [JobStatus::Pending, JobStatus::Running] {
            for job in self.jobs.list(Some(status)).await? {
                if let JobPayload::WebhookRetry { event_id, .. } = job.payload {
                    retained.push(event_id);
                }
            }
        }
        retained.sort_unstable();
        retained.dedup();
        Ok(retained)
    }
}
