//! Staffing table ("quadro de lotação") access.
//!
//! Rows are identified by (plan, position, role) and carry planned, actual,
//! and reserved headcount. Actual headcount always equals the number of
//! active [`Assignment`]s pointing at the row; that invariant is maintained
//! only through [`StaffingRepository`] mutations.
//!
//! Storage backends implement [`StaffingStore`]. Callers never hold a store
//! directly: they go through [`StaffingRepository`], which invalidates every
//! derived cache for the affected plan after each successful write.

mod memory;

pub use memory::MemoryStaffingStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audit::AuditEntry;
use crate::cache::{self, CacheInvalidator};

// =============================================================================
// Types
// =============================================================================

/// Identity of a staffing row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub plan_id: String,
    pub position_id: String,
    pub role_id: String,
}

impl RowKey {
    pub fn new(
        plan_id: impl Into<String>,
        position_id: impl Into<String>,
        role_id: impl Into<String>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            position_id: position_id.into(),
            role_id: role_id.into(),
        }
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.plan_id, self.position_id, self.role_id)
    }
}

/// One entry of the staffing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffingRow {
    pub key: RowKey,
    pub cost_center_id: String,
    pub planned: i32,
    pub actual: i32,
    pub reserved: i32,
    pub active: bool,
    /// Date from which the position is tracked for incremental reporting.
    /// Normalization ignores it.
    pub control_start_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl StaffingRow {
    /// Open slots once filled and reserved headcount are accounted for.
    pub fn available(&self) -> i32 {
        self.planned - self.actual - self.reserved
    }

    pub fn has_capacity(&self) -> bool {
        self.available() > 0
    }
}

/// Where an employee currently sits in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub employee_id: String,
    pub row: RowKey,
    pub hire_date: NaiveDate,
    pub active: bool,
    pub released_on: Option<NaiveDate>,
}

/// Change to one row's actual headcount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDelta {
    pub key: RowKey,
    pub delta: i32,
}

/// Everything one employee event changes, applied as a unit.
#[derive(Debug, Clone)]
pub struct StaffingMutation {
    pub plan_id: String,
    pub deltas: Vec<RowDelta>,
    /// Row the employee must currently be actively assigned to, or `None`
    /// when the employee must not be actively assigned anywhere.
    pub expected_assignment: Option<RowKey>,
    /// Assignment state after the mutation.
    pub assignment: Assignment,
    /// Processed-event ledger key; a second mutation with the same key is a
    /// no-op.
    pub dedup_key: String,
    pub event_kind: String,
    /// Recorded in the same transaction, with before/after rows filled in.
    pub audit: AuditEntry,
}

/// Result of [`StaffingStore::apply_mutation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied {
        before: Vec<StaffingRow>,
        after: Vec<StaffingRow>,
    },
    /// The dedup key was already in the ledger; nothing changed.
    Duplicate,
}

/// Single-row patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowPatch {
    pub actual: Option<i32>,
    pub reserved: Option<i32>,
    pub active: Option<bool>,
}

/// Recomputed actual headcount for one row, applied only if the row still
/// holds `expected_actual`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActualUpdate {
    pub key: RowKey,
    pub expected_actual: i32,
    pub actual: i32,
}

/// Row selection.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub plan_id: String,
    pub cost_center_ids: Option<Vec<String>>,
    pub position_id: Option<String>,
    pub role_id: Option<String>,
    pub active_only: bool,
}

impl RowFilter {
    pub fn plan(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            ..Default::default()
        }
    }

    pub fn cost_center(mut self, cost_center_id: impl Into<String>) -> Self {
        self.cost_center_ids = Some(vec![cost_center_id.into()]);
        self
    }

    pub fn matches(&self, row: &StaffingRow) -> bool {
        row.key.plan_id == self.plan_id
            && self
                .cost_center_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&row.cost_center_id))
            && self
                .position_id
                .as_ref()
                .is_none_or(|p| *p == row.key.position_id)
            && self.role_id.as_ref().is_none_or(|r| *r == row.key.role_id)
            && (!self.active_only || row.active)
    }
}

/// Picks the row an employee with `role_id` lands on among `rows`: the active
/// row with the lowest position id.
pub fn pick_row<'a>(rows: &'a [StaffingRow], role_id: &str) -> Option<&'a StaffingRow> {
    rows.iter()
        .filter(|r| r.active && r.key.role_id == role_id)
        .min_by(|a, b| a.key.cmp(&b.key))
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StaffingError {
    /// Storage could not be reached or the statement failed.
    #[error("staffing storage unavailable: {0}")]
    Unavailable(String),

    #[error("no active staffing plan")]
    NoActivePlan,

    #[error("staffing row not found: {0}")]
    RowNotFound(RowKey),

    #[error("no active assignment for employee {0}")]
    AssignmentNotFound(String),

    #[error("employee {0} is already assigned to an active row")]
    AlreadyAssigned(String),

    #[error("actual headcount of {0} would become negative")]
    NegativeHeadcount(RowKey),

    /// The employee's assignment changed between planning and applying.
    #[error("assignment of employee {0} changed concurrently")]
    StaleAssignment(String),
}

impl StaffingError {
    /// Whether the same call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StaffingError::Unavailable(_) | StaffingError::StaleAssignment(_)
        )
    }
}

impl From<crate::db::DbError> for StaffingError {
    fn from(err: crate::db::DbError) -> Self {
        StaffingError::Unavailable(err.to_string())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Storage backend for the staffing table, its assignments, and the
/// processed-event ledger.
#[async_trait]
pub trait StaffingStore: Send + Sync {
    async fn active_plan_id(&self) -> Result<Option<String>, StaffingError>;

    async fn get_row(&self, key: &RowKey) -> Result<Option<StaffingRow>, StaffingError>;

    /// Rows matching `filter`, in key order.
    async fn list_rows(&self, filter: &RowFilter) -> Result<Vec<StaffingRow>, StaffingError>;

    async fn get_assignment(&self, employee_id: &str)
        -> Result<Option<Assignment>, StaffingError>;

    /// Every assignment (active or not) pointing into `plan_id`.
    async fn list_assignments(&self, plan_id: &str) -> Result<Vec<Assignment>, StaffingError>;

    /// Whether `dedup_key` is already in the processed-event ledger.
    async fn is_processed(&self, dedup_key: &str) -> Result<bool, StaffingError>;

    /// Applies deltas, the assignment change, the ledger key and the audit
    /// entry atomically. The ledger is checked again inside the transaction.
    async fn apply_mutation(
        &self,
        mutation: StaffingMutation,
    ) -> Result<MutationOutcome, StaffingError>;

    /// Atomic single-row update.
    async fn update_row(
        &self,
        key: &RowKey,
        patch: &RowPatch,
        audit: AuditEntry,
    ) -> Result<StaffingRow, StaffingError>;

    /// Sets actual headcount on many rows of one plan in one statement.
    /// Rows whose actual no longer equals `expected_actual` are skipped.
    /// Returns the number of rows written.
    async fn batch_update_actual(
        &self,
        plan_id: &str,
        updates: &[ActualUpdate],
        audit: AuditEntry,
    ) -> Result<u64, StaffingError>;

    /// Drops ledger keys recorded before `cutoff`.
    async fn purge_processed_events(&self, cutoff: DateTime<Utc>) -> Result<u64, StaffingError>;
}

// =============================================================================
// Repository
// =============================================================================

/// The only write path to the staffing table.
#[derive(Clone)]
pub struct StaffingRepository {
    store: Arc<dyn StaffingStore>,
    cache: Arc<dyn CacheInvalidator>,
}

impl StaffingRepository {
    pub fn new(store: Arc<dyn StaffingStore>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { store, cache }
    }

    pub async fn active_plan_id(&self) -> Result<Option<String>, StaffingError> {
        self.store.active_plan_id().await
    }

    pub async fn require_active_plan(&self) -> Result<String, StaffingError> {
        self.store
            .active_plan_id()
            .await?
            .ok_or(StaffingError::NoActivePlan)
    }

    pub async fn get_row(&self, key: &RowKey) -> Result<Option<StaffingRow>, StaffingError> {
        self.store.get_row(key).await
    }

    pub async fn list_rows(&self, filter: &RowFilter) -> Result<Vec<StaffingRow>, StaffingError> {
        self.store.list_rows(filter).await
    }

    pub async fn get_assignment(
        &self,
        employee_id: &str,
    ) -> Result<Option<Assignment>, StaffingError> {
        self.store.get_assignment(employee_id).await
    }

    pub async fn list_assignments(&self, plan_id: &str) -> Result<Vec<Assignment>, StaffingError> {
        self.store.list_assignments(plan_id).await
    }

    pub async fn is_processed(&self, dedup_key: &str) -> Result<bool, StaffingError> {
        self.store.is_processed(dedup_key).await
    }

    pub async fn apply_mutation(
        &self,
        mutation: StaffingMutation,
    ) -> Result<MutationOutcome, StaffingError> {
        let plan_id = mutation.plan_id.clone();
        let outcome = self.store.apply_mutation(mutation).await?;
        if matches!(outcome, MutationOutcome::Applied { .. }) {
            self.invalidate_plan(&plan_id).await;
        }
        Ok(outcome)
    }

    pub async fn update_row(
        &self,
        key: &RowKey,
        patch: &RowPatch,
        audit: AuditEntry,
    ) -> Result<StaffingRow, StaffingError> {
        let row = self.store.update_row(key, patch, audit).await?;
        self.invalidate_plan(&key.plan_id).await;
        Ok(row)
    }

    pub async fn batch_update_actual(
        &self,
        plan_id: &str,
        updates: &[ActualUpdate],
        audit: AuditEntry,
    ) -> Result<u64, StaffingError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let written = self
            .store
            .batch_update_actual(plan_id, updates, audit)
            .await?;
        if written > 0 {
            self.invalidate_plan(plan_id).await;
        }
        Ok(written)
    }

    pub async fn purge_processed_events(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StaffingError> {
        self.store.purge_processed_events(cutoff).await
    }

    async fn invalidate_plan(&self, plan_id: &str) {
        for pattern in cache::plan_patterns(plan_id) {
            if let Err(e) = self.cache.invalidate_pattern(&pattern).await {
                warn!(error = %e, pattern = %pattern, "Failed to invalidate derived cache");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(position: &str, role: &str, planned: i32, actual: i32, active: bool) -> StaffingRow {
        StaffingRow {
            key: RowKey::new("ql_2024", position, role),
            cost_center_id: "cc_ti".to_string(),
            planned,
            actual,
            reserved: 0,
            active,
            control_start_date: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_pick_row_lowest_active_position() {
        let rows = vec![
            row("posto_02", "cargo_dev", 2, 0, true),
            row("posto_01", "cargo_dev", 1, 1, false),
            row("posto_03", "cargo_dev", 1, 1, true),
        ];
        let picked = pick_row(&rows, "cargo_dev").unwrap();
        assert_eq!(picked.key.position_id, "posto_02");
        assert!(pick_row(&rows, "cargo_qa").is_none());
    }

    #[test]
    fn test_filter_matches() {
        let r = row("posto_01", "cargo_dev", 1, 0, false);
        assert!(RowFilter::plan("ql_2024").cost_center("cc_ti").matches(&r));
        assert!(!RowFilter::plan("ql_2024").cost_center("cc_rh").matches(&r));
        let active_only = RowFilter {
            active_only: true,
            ..RowFilter::plan("ql_2024")
        };
        assert!(!active_only.matches(&r));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StaffingError::Unavailable("reset".into()).is_transient());
        assert!(StaffingError::StaleAssignment("col_001".into()).is_transient());
        assert!(!StaffingError::RowNotFound(RowKey::new("p", "x", "r")).is_transient());
        assert!(!StaffingError::AssignmentNotFound("col_001".into()).is_transient());
    }
}
