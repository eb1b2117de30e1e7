//! Normalization engine.
//!
//! Translates one employee event into staffing-row deltas and applies them
//! through the [`StaffingRepository`]:
//!
//! | Event       | Mutation                                              |
//! |-------------|-------------------------------------------------------|
//! | admission   | +1 on the target row, assignment created              |
//! | termination | -1 on the assigned row, assignment released           |
//! | transfer    | -1 source, +1 row in the new cost center              |
//! | promotion   | -1 prior-role row, +1 new-role row, same cost center  |
//!
//! Every mutation carries the event's dedup key, so replaying an event that
//! was already applied changes nothing. Bulk renormalization recounts actual
//! headcount from assignments.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use lotacao_events::{ActorType, ColaboradorEvent, EmployeeChange};
use lotacao_id::WebhookEventId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::audit::{AuditAction, AuditEntry};
use crate::staffing::{
    pick_row, ActualUpdate, Assignment, MutationOutcome, RowDelta, RowFilter, RowKey,
    StaffingError, StaffingMutation, StaffingRepository, StaffingRow,
};

// =============================================================================
// Applier contract
// =============================================================================

/// Who is applying an event, and under which request.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub actor_type: ActorType,
    pub actor_id: String,
    pub request_id: Option<String>,
    pub webhook_event_id: Option<WebhookEventId>,
    /// 1-based attempt number, set by the retry coordinator.
    pub attempt: u32,
}

impl ApplyContext {
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            request_id: None,
            webhook_event_id: None,
            attempt: 1,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_webhook_event(mut self, id: WebhookEventId) -> Self {
        self.webhook_event_id = Some(id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { deltas: Vec<RowDelta> },
    /// The event's dedup key was already recorded; nothing changed.
    AlreadyApplied,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NormalizationError {
    /// Storage or network failure; the same call may succeed later.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The event does not fit the stored staffing data (missing row, missing
    /// or mismatched assignment). Retrying cannot help.
    #[error("data integrity error: {0}")]
    Integrity(String),
}

impl NormalizationError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NormalizationError::Transient(_) | NormalizationError::Timeout(_)
        )
    }
}

impl From<StaffingError> for NormalizationError {
    fn from(err: StaffingError) -> Self {
        if err.is_transient() {
            NormalizationError::Transient(err.to_string())
        } else {
            NormalizationError::Integrity(err.to_string())
        }
    }
}

/// Applies one event to the staffing table.
#[async_trait]
pub trait EventApplier: Send + Sync {
    async fn apply(
        &self,
        event: &ColaboradorEvent,
        ctx: &ApplyContext,
    ) -> Result<ApplyOutcome, NormalizationError>;
}

// =============================================================================
// Bulk normalization types
// =============================================================================

/// Rows to recount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationScope {
    /// Defaults to the active plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_center_ids: Option<Vec<String>>,
    /// Limits the recount to rows touched by an assignment hired in range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hired_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hired_to: Option<NaiveDate>,
}

impl NormalizationScope {
    fn has_date_range(&self) -> bool {
        self.hired_from.is_some() || self.hired_to.is_some()
    }

    fn hired_in_range(&self, hire_date: NaiveDate) -> bool {
        self.hired_from.is_none_or(|from| hire_date >= from)
            && self.hired_to.is_none_or(|to| hire_date <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCorrection {
    pub key: RowKey,
    pub before: i32,
    pub after: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationSummary {
    pub plan_id: String,
    pub rows_scanned: usize,
    pub rows_corrected: u64,
    /// Corrections that were skipped because the row changed concurrently.
    pub rows_skipped: u64,
    pub corrections: Vec<RowCorrection>,
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Clone)]
pub struct NormalizationEngine {
    repo: StaffingRepository,
}

impl NormalizationEngine {
    pub fn new(repo: StaffingRepository) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &StaffingRepository {
        &self.repo
    }

    /// Recomputes actual headcount from active assignments for every row in
    /// scope, whatever its control start date, and writes the changed rows
    /// in one batch.
    #[instrument(skip(self), fields(plan_id))]
    pub async fn renormalize(
        &self,
        scope: &NormalizationScope,
    ) -> Result<NormalizationSummary, NormalizationError> {
        let plan_id = match &scope.plan_id {
            Some(id) => id.clone(),
            None => self.repo.require_active_plan().await?,
        };
        tracing::Span::current().record("plan_id", plan_id.as_str());

        let filter = RowFilter {
            cost_center_ids: scope.cost_center_ids.clone(),
            ..RowFilter::plan(plan_id.clone())
        };
        let mut rows = self.repo.list_rows(&filter).await?;
        let assignments = self.repo.list_assignments(&plan_id).await?;

        if scope.has_date_range() {
            let touched: BTreeSet<&RowKey> = assignments
                .iter()
                .filter(|a| scope.hired_in_range(a.hire_date))
                .map(|a| &a.row)
                .collect();
            rows.retain(|r| touched.contains(&r.key));
        }

        let mut counts: HashMap<&RowKey, i32> = HashMap::new();
        for assignment in assignments.iter().filter(|a| a.active) {
            *counts.entry(&assignment.row).or_default() += 1;
        }

        let corrections: Vec<RowCorrection> = rows
            .iter()
            .filter_map(|row| {
                let counted = counts.get(&row.key).copied().unwrap_or(0);
                (counted != row.actual).then(|| RowCorrection {
                    key: row.key.clone(),
                    before: row.actual,
                    after: counted,
                })
            })
            .collect();

        let updates: Vec<ActualUpdate> = corrections
            .iter()
            .map(|c| ActualUpdate {
                key: c.key.clone(),
                expected_actual: c.before,
                actual: c.after,
            })
            .collect();

        let audit = AuditEntry::new(AuditAction::BulkNormalization, "staffing_plan", &plan_id)
            .reason(format!(
                "recounted {} rows, {} out of date",
                rows.len(),
                corrections.len()
            ));
        let written = self
            .repo
            .batch_update_actual(&plan_id, &updates, audit)
            .await?;

        info!(
            plan_id = %plan_id,
            rows_scanned = rows.len(),
            rows_corrected = written,
            "Bulk normalization finished"
        );

        Ok(NormalizationSummary {
            plan_id,
            rows_scanned: rows.len(),
            rows_corrected: written,
            rows_skipped: updates.len() as u64 - written,
            corrections,
        })
    }

    /// Builds the mutation for `event` against the current assignment.
    async fn plan(
        &self,
        event: &ColaboradorEvent,
        ctx: &ApplyContext,
    ) -> Result<StaffingMutation, NormalizationError> {
        let plan_id = self.repo.require_active_plan().await?;
        let current = self
            .repo
            .get_assignment(&event.employee_id)
            .await?
            .filter(|a| a.active);

        let (deltas, assignment) = match &event.change {
            EmployeeChange::Admission => {
                if current.is_some() {
                    return Err(
                        StaffingError::AlreadyAssigned(event.employee_id.clone()).into(),
                    );
                }
                let target = self
                    .locate_row(
                        &plan_id,
                        event.position_id.as_deref(),
                        &event.cost_center_id,
                        &event.role_id,
                    )
                    .await?;
                (
                    vec![RowDelta {
                        key: target.clone(),
                        delta: 1,
                    }],
                    Assignment {
                        employee_id: event.employee_id.clone(),
                        row: target,
                        hire_date: event.hire_date,
                        active: true,
                        released_on: None,
                    },
                )
            }

            EmployeeChange::Termination { termination_date } => {
                let current = require_assignment(current.as_ref(), event)?;
                (
                    vec![RowDelta {
                        key: current.row.clone(),
                        delta: -1,
                    }],
                    Assignment {
                        active: false,
                        released_on: Some(*termination_date),
                        ..current.clone()
                    },
                )
            }

            EmployeeChange::Transfer {
                previous_cost_center_id,
                previous_role_id,
            } => {
                let current = require_assignment(current.as_ref(), event)?;
                let source = self.source_row(&current.row).await?;
                if source.cost_center_id != *previous_cost_center_id {
                    return Err(NormalizationError::Integrity(format!(
                        "employee {} sits in cost center {}, not {}",
                        event.employee_id, source.cost_center_id, previous_cost_center_id
                    )));
                }
                if let Some(previous_role_id) = previous_role_id {
                    check_role(current, previous_role_id)?;
                }
                let destination = self
                    .locate_row(
                        &plan_id,
                        event.position_id.as_deref(),
                        &event.cost_center_id,
                        &event.role_id,
                    )
                    .await?;
                move_deltas(current, destination)
            }

            EmployeeChange::Promotion { previous_role_id } => {
                let current = require_assignment(current.as_ref(), event)?;
                check_role(current, previous_role_id)?;
                let source = self.source_row(&current.row).await?;
                let destination = self
                    .locate_row(
                        &plan_id,
                        event.position_id.as_deref(),
                        &source.cost_center_id,
                        &event.role_id,
                    )
                    .await?;
                move_deltas(current, destination)
            }
        };

        let audit = AuditEntry::new(AuditAction::EventApplied, "employee", &event.employee_id)
            .actor(ctx.actor_type, &ctx.actor_id)
            .reason(format!("{} applied", event.kind()))
            .request_id(ctx.request_id.clone())
            .attempt(ctx.attempt);

        Ok(StaffingMutation {
            plan_id,
            deltas,
            expected_assignment: current.map(|a| a.row),
            assignment,
            dedup_key: event.dedup_key(),
            event_kind: event.kind().to_string(),
            audit,
        })
    }

    /// Explicit position when given, otherwise the lowest active position in
    /// the cost center planned for the role.
    async fn locate_row(
        &self,
        plan_id: &str,
        position_id: Option<&str>,
        cost_center_id: &str,
        role_id: &str,
    ) -> Result<RowKey, NormalizationError> {
        if let Some(position_id) = position_id {
            let key = RowKey::new(plan_id, position_id, role_id);
            return match self.repo.get_row(&key).await? {
                Some(row) => Ok(row.key),
                None => Err(StaffingError::RowNotFound(key).into()),
            };
        }

        let filter = RowFilter {
            role_id: Some(role_id.to_string()),
            active_only: true,
            ..RowFilter::plan(plan_id).cost_center(cost_center_id)
        };
        let rows = self.repo.list_rows(&filter).await?;
        pick_row(&rows, role_id)
            .map(|row| row.key.clone())
            .ok_or_else(|| {
                NormalizationError::Integrity(format!(
                    "no active row for role {role_id} in cost center {cost_center_id} of plan {plan_id}"
                ))
            })
    }

    async fn source_row(&self, key: &RowKey) -> Result<StaffingRow, NormalizationError> {
        self.repo
            .get_row(key)
            .await?
            .ok_or_else(|| StaffingError::RowNotFound(key.clone()).into())
    }
}

fn require_assignment<'a>(
    current: Option<&'a Assignment>,
    event: &ColaboradorEvent,
) -> Result<&'a Assignment, NormalizationError> {
    current.ok_or_else(|| StaffingError::AssignmentNotFound(event.employee_id.clone()).into())
}

fn check_role(current: &Assignment, previous_role_id: &str) -> Result<(), NormalizationError> {
    if current.row.role_id != previous_role_id {
        return Err(NormalizationError::Integrity(format!(
            "employee {} holds role {}, not {}",
            current.employee_id, current.row.role_id, previous_role_id
        )));
    }
    Ok(())
}

fn move_deltas(current: &Assignment, destination: RowKey) -> (Vec<RowDelta>, Assignment) {
    (
        vec![
            RowDelta {
                key: current.row.clone(),
                delta: -1,
            },
            RowDelta {
                key: destination.clone(),
                delta: 1,
            },
        ],
        Assignment {
            row: destination,
            ..current.clone()
        },
    )
}

#[async_trait]
impl EventApplier for NormalizationEngine {
    #[instrument(skip(self, event, ctx), fields(employee_id = %event.employee_id, kind = %event.kind(), attempt = ctx.attempt))]
    async fn apply(
        &self,
        event: &ColaboradorEvent,
        ctx: &ApplyContext,
    ) -> Result<ApplyOutcome, NormalizationError> {
        if self.repo.is_processed(&event.dedup_key()).await? {
            debug!("Event already applied");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let mutation = self.plan(event, ctx).await?;
        let deltas = mutation.deltas.clone();
        match self.repo.apply_mutation(mutation).await? {
            MutationOutcome::Applied { .. } => {
                info!(deltas = deltas.len(), "Event applied");
                Ok(ApplyOutcome::Applied { deltas })
            }
            MutationOutcome::Duplicate => Ok(ApplyOutcome::AlreadyApplied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staffing::RowPatch;
    use crate::test_support::{admission, date, event, fixture, PLAN};

    fn ctx() -> ApplyContext {
        ApplyContext::new(ActorType::HrSystem, "hr")
    }

    #[tokio::test]
    async fn test_admission_increments_exactly_one_row() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let before = fx.store.rows();

        let outcome = engine
            .apply(&admission("col_300", "cargo_dev", "cc_ti"), &ctx())
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));

        let after = fx.store.rows();
        let changed: Vec<_> = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| b.actual != a.actual)
            .collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].1.key.position_id, "posto_ti_01");
        assert_eq!(changed[0].1.actual, changed[0].0.actual + 1);

        let assignment = fx.repo.get_assignment("col_300").await.unwrap().unwrap();
        assert!(assignment.active);
        assert_eq!(fx.audit.count(AuditAction::EventApplied), 1);
        assert!(fx.cache.patterns().iter().any(|p| p == "ocupacao:ql_2024:*"));
    }

    #[tokio::test]
    async fn test_admission_with_explicit_position() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let mut ev = admission("col_300", "cargo_dev", "cc_ti");
        ev.position_id = Some("posto_ti_02".to_string());

        engine.apply(&ev, &ctx()).await.unwrap();
        assert_eq!(fx.row("posto_ti_02", "cargo_dev").actual, 1);
        assert_eq!(fx.row("posto_ti_01", "cargo_dev").actual, 1);
    }

    #[tokio::test]
    async fn test_replay_is_noop() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let ev = admission("col_300", "cargo_dev", "cc_ti");

        engine.apply(&ev, &ctx()).await.unwrap();
        let total = fx.total_actual();
        let again = engine.apply(&ev, &ctx()).await.unwrap();

        assert_eq!(again, ApplyOutcome::AlreadyApplied);
        assert_eq!(fx.total_actual(), total);
        assert_eq!(fx.audit.count(AuditAction::EventApplied), 1);
    }

    #[tokio::test]
    async fn test_termination_releases_assignment() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let ev = event(
            "col_100",
            "cargo_dev",
            "cc_ti",
            EmployeeChange::Termination {
                termination_date: date(2024, 6, 30),
            },
        );

        engine.apply(&ev, &ctx()).await.unwrap();
        assert_eq!(fx.row("posto_ti_01", "cargo_dev").actual, 0);
        let assignment = fx.repo.get_assignment("col_100").await.unwrap().unwrap();
        assert!(!assignment.active);
        assert_eq!(assignment.released_on, Some(date(2024, 6, 30)));
    }

    #[tokio::test]
    async fn test_termination_without_assignment_is_integrity_error() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let ev = event(
            "col_999",
            "cargo_dev",
            "cc_ti",
            EmployeeChange::Termination {
                termination_date: date(2024, 6, 30),
            },
        );

        let err = engine.apply(&ev, &ctx()).await.unwrap_err();
        assert!(matches!(err, NormalizationError::Integrity(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_transfer_conserves_total() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let total = fx.total_actual();
        let ev = event(
            "col_100",
            "cargo_dev",
            "cc_rh",
            EmployeeChange::Transfer {
                previous_cost_center_id: "cc_ti".to_string(),
                previous_role_id: None,
            },
        );

        let outcome = engine.apply(&ev, &ctx()).await.unwrap();
        let ApplyOutcome::Applied { deltas } = outcome else {
            panic!("expected applied");
        };
        assert_eq!(deltas.iter().map(|d| d.delta).sum::<i32>(), 0);
        assert_eq!(fx.total_actual(), total);
        assert_eq!(fx.row("posto_ti_01", "cargo_dev").actual, 0);
        assert_eq!(fx.row("posto_rh_01", "cargo_dev").actual, 1);
    }

    #[tokio::test]
    async fn test_transfer_from_wrong_cost_center() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let ev = event(
            "col_100",
            "cargo_dev",
            "cc_rh",
            EmployeeChange::Transfer {
                previous_cost_center_id: "cc_fin".to_string(),
                previous_role_id: None,
            },
        );

        let err = engine.apply(&ev, &ctx()).await.unwrap_err();
        assert!(matches!(err, NormalizationError::Integrity(_)));
        assert_eq!(fx.row("posto_ti_01", "cargo_dev").actual, 1);
    }

    #[tokio::test]
    async fn test_promotion_moves_within_cost_center() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let total = fx.total_actual();
        let ev = event(
            "col_100",
            "cargo_dev_senior",
            "cc_ti",
            EmployeeChange::Promotion {
                previous_role_id: "cargo_dev".to_string(),
            },
        );

        engine.apply(&ev, &ctx()).await.unwrap();
        assert_eq!(fx.row("posto_ti_01", "cargo_dev").actual, 0);
        assert_eq!(fx.row("posto_ti_03", "cargo_dev_senior").actual, 1);
        assert_eq!(fx.total_actual(), total);
    }

    #[tokio::test]
    async fn test_admission_without_row_is_integrity_error() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());

        let err = engine
            .apply(&admission("col_300", "cargo_dev", "cc_fin"), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizationError::Integrity(_)));
        assert_eq!(fx.store.ledger_len(), 0);
    }

    #[tokio::test]
    async fn test_renormalize_recounts_regardless_of_control_start() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let drifted = RowKey::new(PLAN, "posto_ti_02", "cargo_dev");
        fx.repo
            .update_row(
                &drifted,
                &RowPatch {
                    actual: Some(1),
                    ..Default::default()
                },
                AuditEntry::new(AuditAction::RowUpdated, "staffing_row", drifted.to_string()),
            )
            .await
            .unwrap();
        let mut tracked = fx.row("posto_rh_02", "cargo_analista");
        tracked.control_start_date = Some(date(2030, 1, 1));
        tracked.actual = 0;
        fx.store.insert_row(tracked);

        let summary = engine
            .renormalize(&NormalizationScope::default())
            .await
            .unwrap();

        assert_eq!(summary.plan_id, PLAN);
        assert_eq!(summary.rows_scanned, 6);
        assert_eq!(summary.rows_corrected, 2);
        assert_eq!(summary.rows_skipped, 0);
        assert_eq!(fx.row("posto_ti_02", "cargo_dev").actual, 0);
        assert_eq!(fx.row("posto_rh_02", "cargo_analista").actual, 1);
        assert_eq!(fx.audit.count(AuditAction::BulkNormalization), 1);
    }

    #[tokio::test]
    async fn test_renormalize_scoped_by_hire_date() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        for (position, role) in [("posto_ti_01", "cargo_dev"), ("posto_rh_02", "cargo_analista")] {
            let mut row = fx.row(position, role);
            row.actual = 0;
            fx.store.insert_row(row);
        }

        // Only col_200 (hired 2024-02-01) is in range.
        let scope = NormalizationScope {
            hired_from: Some(date(2024, 1, 1)),
            ..Default::default()
        };
        let summary = engine.renormalize(&scope).await.unwrap();

        assert_eq!(summary.rows_scanned, 1);
        assert_eq!(summary.corrections[0].key.position_id, "posto_rh_02");
        assert_eq!(fx.row("posto_rh_02", "cargo_analista").actual, 1);
        assert_eq!(fx.row("posto_ti_01", "cargo_dev").actual, 0);
    }

    #[tokio::test]
    async fn test_renormalize_clean_plan_writes_nothing() {
        let fx = fixture();
        let engine = NormalizationEngine::new(fx.repo.clone());
        let scope = NormalizationScope {
            cost_center_ids: Some(vec!["cc_ti".to_string()]),
            ..Default::default()
        };

        let summary = engine.renormalize(&scope).await.unwrap();
        assert_eq!(summary.rows_scanned, 3);
        assert!(summary.corrections.is_empty());
        assert_eq!(fx.audit.count(AuditAction::BulkNormalization), 0);
        assert!(fx.cache.patterns().is_empty());
    }

    #[test]
    fn test_staffing_error_classification() {
        let transient: NormalizationError = StaffingError::Unavailable("reset".into()).into();
        assert!(transient.is_transient());
        let integrity: NormalizationError =
            StaffingError::RowNotFound(RowKey::new(PLAN, "x", "y")).into();
        assert!(!integrity.is_transient());
        assert!(NormalizationError::Timeout(Duration::from_secs(2)).is_transient());
    }
}
