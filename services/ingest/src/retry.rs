//! Bounded retry around one normalization call.

use std::sync::Arc;
use std::time::Duration;

use lotacao_events::ColaboradorEvent;
use tracing::{error, info, instrument, warn};

use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::normalization::{ApplyContext, ApplyOutcome, EventApplier, NormalizationError};

/// Attempt budget and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Budget for a single attempt; running over counts as a transient
    /// failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Same policy, one attempt. Used when an outer job already bounds the
    /// number of tries.
    pub fn single_attempt(self) -> Self {
        Self {
            max_attempts: 1,
            ..self
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs an [`EventApplier`] under a [`RetryPolicy`], auditing every attempt.
#[derive(Clone)]
pub struct RetryCoordinator {
    applier: Arc<dyn EventApplier>,
    audit: Arc<dyn AuditSink>,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(
        applier: Arc<dyn EventApplier>,
        audit: Arc<dyn AuditSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            applier,
            audit,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn run(
        &self,
        event: &ColaboradorEvent,
        ctx: &ApplyContext,
    ) -> Result<ApplyOutcome, NormalizationError> {
        self.run_with_policy(event, ctx, self.policy).await
    }

    /// Retries transient failures up to `policy.max_attempts`; returns the
    /// last error once attempts run out. Integrity errors fail immediately.
    #[instrument(skip(self, event, ctx, policy), fields(employee_id = %event.employee_id, kind = %event.kind()))]
    pub async fn run_with_policy(
        &self,
        event: &ColaboradorEvent,
        ctx: &ApplyContext,
        policy: RetryPolicy,
    ) -> Result<ApplyOutcome, NormalizationError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let attempt_ctx = ApplyContext {
                attempt,
                ..ctx.clone()
            };
            let call = self.applier.apply(event, &attempt_ctx);
            let result = match tokio::time::timeout(policy.attempt_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(NormalizationError::Timeout(policy.attempt_timeout)),
            };

            let err = match result {
                Ok(ApplyOutcome::AlreadyApplied) => {
                    info!(attempt, "Duplicate event suppressed");
                    self.record(
                        self.entry(AuditAction::DuplicateSuppressed, event, &attempt_ctx)
                            .reason("event already applied"),
                    )
                    .await;
                    return Ok(ApplyOutcome::AlreadyApplied);
                }
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            if !err.is_transient() {
                error!(
                    kind = "data_integrity",
                    attempt,
                    error = %err,
                    "Event does not fit staffing data"
                );
                self.record(
                    self.entry(AuditAction::IntegrityFailure, event, &attempt_ctx)
                        .reason(err.to_string()),
                )
                .await;
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(attempt, error = %err, "Retries exhausted");
                self.record(
                    self.entry(AuditAction::ApplyFailed, event, &attempt_ctx)
                        .reason(err.to_string()),
                )
                .await;
                return Err(err);
            }

            let delay = policy.delay_for(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            self.record(
                self.entry(AuditAction::ApplyRetry, event, &attempt_ctx)
                    .reason(err.to_string()),
            )
            .await;

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    fn entry(
        &self,
        action: AuditAction,
        event: &ColaboradorEvent,
        ctx: &ApplyContext,
    ) -> AuditEntry {
        AuditEntry::new(action, "employee", &event.employee_id)
            .actor(ctx.actor_type, &ctx.actor_id)
            .request_id(ctx.request_id.clone())
            .attempt(ctx.attempt)
    }

    async fn record(&self, entry: AuditEntry) {
        audit::record(self.audit.as_ref(), entry).await;
    }
}
