//! Application state shared across request handlers and workers.

use std::sync::Arc;

use crate::audit::{AuditSink, MemoryAuditLog};
use crate::cache::{CacheInvalidator, NoCache};
use crate::cleanup::{CleanupWorker, CleanupWorkerConfig};
use crate::db::Database;
use crate::gateway::{GatewayDeps, WebhookGateway};
use crate::inbox::{MemoryWebhookEventStore, WebhookEventStore};
use crate::jobs::{JobExecutor, JobScheduler, JobStore, MemoryJobStore, SchedulerConfig};
use crate::normalization::NormalizationEngine;
use crate::notify::{LogNotifier, Notifier};
use crate::proposals::{MemoryProposalStore, ProposalStore};
use crate::resolver::{DiscrepancyResolver, RuleTable};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::staffing::{MemoryStaffingStore, StaffingRepository, StaffingStore};

/// Storage and outbound collaborators.
#[derive(Clone)]
pub struct Stores {
    pub staffing: Arc<dyn StaffingStore>,
    pub audit: Arc<dyn AuditSink>,
    pub webhooks: Arc<dyn WebhookEventStore>,
    pub proposals: Arc<dyn ProposalStore>,
    pub jobs: Arc<dyn JobStore>,
    pub cache: Arc<dyn CacheInvalidator>,
    pub notifier: Arc<dyn Notifier>,
}

impl Stores {
    /// Postgres-backed stores. The job table stays in-process.
    pub fn postgres(db: &Database) -> Self {
        Self {
            staffing: Arc::new(db.staffing_store()),
            audit: Arc::new(db.audit_log()),
            webhooks: Arc::new(db.webhook_store()),
            proposals: Arc::new(db.proposal_store()),
            jobs: Arc::new(MemoryJobStore::new()),
            cache: Arc::new(NoCache),
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Process-local stores sharing one audit log.
    pub fn memory() -> Self {
        let audit = Arc::new(MemoryAuditLog::new());
        Self {
            staffing: Arc::new(MemoryStaffingStore::new(audit.clone())),
            audit,
            webhooks: Arc::new(MemoryWebhookEventStore::new()),
            proposals: Arc::new(MemoryProposalStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
            cache: Arc::new(NoCache),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Behavior knobs taken from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct StateOptions {
    pub webhook_secret: String,
    pub retry: RetryPolicy,
    pub scheduler: SchedulerConfig,
    pub job_max_attempts: u32,
    pub rules: RuleTable,
}

impl StateOptions {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            job_max_attempts: 3,
            rules: RuleTable::default(),
        }
    }
}

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Option<Database>,
    stores: Stores,
    repo: StaffingRepository,
    gateway: WebhookGateway,
    scheduler: JobScheduler,
    job_max_attempts: u32,
}

impl AppState {
    /// Wires the pipeline over `stores`. `db` is only used for readiness.
    pub fn new(stores: Stores, options: StateOptions, db: Option<Database>) -> Self {
        let repo = StaffingRepository::new(stores.staffing.clone(), stores.cache.clone());
        let engine = NormalizationEngine::new(repo.clone());
        let coordinator =
            RetryCoordinator::new(Arc::new(engine.clone()), stores.audit.clone(), options.retry);
        let resolver = DiscrepancyResolver::new(repo.clone(), Arc::new(options.rules));
        let executor = JobExecutor::new(
            engine,
            coordinator.clone(),
            resolver.clone(),
            stores.webhooks.clone(),
        );
        let scheduler = JobScheduler::new(
            stores.jobs.clone(),
            Arc::new(executor),
            stores.audit.clone(),
            stores.notifier.clone(),
            options.scheduler,
        );
        let gateway = WebhookGateway::new(
            options.webhook_secret.as_bytes(),
            options.job_max_attempts,
            GatewayDeps {
                resolver,
                coordinator,
                webhooks: stores.webhooks.clone(),
                proposals: stores.proposals.clone(),
                jobs: scheduler.clone(),
                audit: stores.audit.clone(),
                notifier: stores.notifier.clone(),
            },
        );

        Self {
            inner: Arc::new(AppStateInner {
                db,
                stores,
                repo,
                gateway,
                scheduler,
                job_max_attempts: options.job_max_attempts,
            }),
        }
    }

    /// Database handle when running on Postgres.
    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn repository(&self) -> &StaffingRepository {
        &self.inner.repo
    }

    pub fn gateway(&self) -> &WebhookGateway {
        &self.inner.gateway
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.inner.scheduler
    }

    pub fn job_max_attempts(&self) -> u32 {
        self.inner.job_max_attempts
    }

    pub fn cleanup_worker(&self, config: CleanupWorkerConfig) -> CleanupWorker {
        CleanupWorker::new(
            self.inner.repo.clone(),
            self.inner.stores.jobs.clone(),
            self.inner.stores.webhooks.clone(),
            self.inner.stores.proposals.clone(),
            config,
        )
    }
}
