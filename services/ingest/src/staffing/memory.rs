//! In-process staffing store.
//!
//! One lock guards every table, so each mutation is applied all-or-nothing
//! and no reader can observe a half-applied transfer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ActualUpdate, Assignment, MutationOutcome, RowFilter, RowKey, RowPatch, StaffingError,
    StaffingMutation, StaffingRow, StaffingStore,
};
use crate::audit::{AuditEntry, MemoryAuditLog};

#[derive(Default)]
struct Tables {
    plans: BTreeMap<String, bool>,
    rows: BTreeMap<RowKey, StaffingRow>,
    assignments: HashMap<String, Assignment>,
    ledger: HashMap<String, DateTime<Utc>>,
}

pub struct MemoryStaffingStore {
    tables: Mutex<Tables>,
    audit: Arc<MemoryAuditLog>,
}

impl MemoryStaffingStore {
    pub fn new(audit: Arc<MemoryAuditLog>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            audit,
        }
    }

    /// Registers a plan. Activating a plan deactivates every other one.
    pub fn add_plan(&self, plan_id: impl Into<String>, active: bool) {
        let mut tables = self.lock();
        if active {
            for flag in tables.plans.values_mut() {
                *flag = false;
            }
        }
        tables.plans.insert(plan_id.into(), active);
    }

    pub fn insert_row(&self, row: StaffingRow) {
        self.lock().rows.insert(row.key.clone(), row);
    }

    pub fn insert_assignment(&self, assignment: Assignment) {
        self.lock()
            .assignments
            .insert(assignment.employee_id.clone(), assignment);
    }

    /// Snapshot of every row, in key order.
    pub fn rows(&self) -> Vec<StaffingRow> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn ledger_len(&self) -> usize {
        self.lock().ledger.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn rows_json(rows: &[StaffingRow]) -> serde_json::Value {
    serde_json::to_value(rows).unwrap_or(serde_json::Value::Null)
}

#[async_trait]
impl StaffingStore for MemoryStaffingStore {
    async fn active_plan_id(&self) -> Result<Option<String>, StaffingError> {
        Ok(self
            .lock()
            .plans
            .iter()
            .find(|(_, active)| **active)
            .map(|(id, _)| id.clone()))
    }

    async fn get_row(&self, key: &RowKey) -> Result<Option<StaffingRow>, StaffingError> {
        Ok(self.lock().rows.get(key).cloned())
    }

    async fn list_rows(&self, filter: &RowFilter) -> Result<Vec<StaffingRow>, StaffingError> {
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get_assignment(
        &self,
        employee_id: &str,
    ) -> Result<Option<Assignment>, StaffingError> {
        Ok(self.lock().assignments.get(employee_id).cloned())
    }

    async fn list_assignments(&self, plan_id: &str) -> Result<Vec<Assignment>, StaffingError> {
        let mut assignments: Vec<Assignment> = self
            .lock()
            .assignments
            .values()
            .filter(|a| a.row.plan_id == plan_id)
            .cloned()
            .collect();
        assignments.sort_by(|a, b| a.employee_id.cmp(&b.employee_id));
        Ok(assignments)
    }

    async fn is_processed(&self, dedup_key: &str) -> Result<bool, StaffingError> {
        Ok(self.lock().ledger.contains_key(dedup_key))
    }

    async fn apply_mutation(
        &self,
        mutation: StaffingMutation,
    ) -> Result<MutationOutcome, StaffingError> {
        let mut tables = self.lock();

        if tables.ledger.contains_key(&mutation.dedup_key) {
            return Ok(MutationOutcome::Duplicate);
        }

        let employee_id = &mutation.assignment.employee_id;
        let current = tables
            .assignments
            .get(employee_id)
            .filter(|a| a.active)
            .map(|a| a.row.clone());
        if current != mutation.expected_assignment {
            return Err(StaffingError::StaleAssignment(employee_id.clone()));
        }

        // Validate every delta before touching anything.
        let mut keys: Vec<&RowKey> = mutation.deltas.iter().map(|d| &d.key).collect();
        keys.sort();
        keys.dedup();
        let mut before = Vec::with_capacity(keys.len());
        let mut after = Vec::with_capacity(keys.len());
        let now = Utc::now();
        for key in keys {
            let row = tables
                .rows
                .get(key)
                .ok_or_else(|| StaffingError::RowNotFound(key.clone()))?;
            let delta: i32 = mutation
                .deltas
                .iter()
                .filter(|d| &d.key == key)
                .map(|d| d.delta)
                .sum();
            let mut updated = row.clone();
            updated.actual += delta;
            if updated.actual < 0 {
                return Err(StaffingError::NegativeHeadcount(key.clone()));
            }
            updated.updated_at = now;
            before.push(row.clone());
            after.push(updated);
        }

        for row in &after {
            tables.rows.insert(row.key.clone(), row.clone());
        }
        tables
            .assignments
            .insert(employee_id.clone(), mutation.assignment.clone());
        tables.ledger.insert(mutation.dedup_key.clone(), now);

        self.audit.append(
            mutation
                .audit
                .before(rows_json(&before))
                .after(rows_json(&after)),
        );

        Ok(MutationOutcome::Applied { before, after })
    }

    async fn update_row(
        &self,
        key: &RowKey,
        patch: &RowPatch,
        audit: AuditEntry,
    ) -> Result<StaffingRow, StaffingError> {
        let mut tables = self.lock();
        let row = tables
            .rows
            .get_mut(key)
            .ok_or_else(|| StaffingError::RowNotFound(key.clone()))?;
        let before = row.clone();

        if let Some(actual) = patch.actual {
            if actual < 0 {
                return Err(StaffingError::NegativeHeadcount(key.clone()));
            }
            row.actual = actual;
        }
        if let Some(reserved) = patch.reserved {
            row.reserved = reserved;
        }
        if let Some(active) = patch.active {
            row.active = active;
        }
        row.updated_at = Utc::now();
        let after = row.clone();

        self.audit.append(
            audit
                .before(rows_json(std::slice::from_ref(&before)))
                .after(rows_json(std::slice::from_ref(&after))),
        );
        Ok(after)
    }

    async fn batch_update_actual(
        &self,
        plan_id: &str,
        updates: &[ActualUpdate],
        audit: AuditEntry,
    ) -> Result<u64, StaffingError> {
        let mut tables = self.lock();
        let now = Utc::now();
        let mut before = Vec::new();
        let mut after = Vec::new();

        for update in updates.iter().filter(|u| u.key.plan_id == plan_id) {
            let Some(row) = tables.rows.get_mut(&update.key) else {
                continue;
            };
            if row.actual != update.expected_actual {
                continue;
            }
            before.push(row.clone());
            row.actual = update.actual;
            row.updated_at = now;
            after.push(row.clone());
        }

        if !after.is_empty() {
            self.audit
                .append(audit.before(rows_json(&before)).after(rows_json(&after)));
        }
        Ok(after.len() as u64)
    }

    async fn purge_processed_events(&self, cutoff: DateTime<Utc>) -> Result<u64, StaffingError> {
        let mut tables = self.lock();
        let len = tables.ledger.len();
        tables.ledger.retain(|_, processed_at| *processed_at >= cutoff);
        Ok((len - tables.ledger.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::staffing::RowDelta;
    use chrono::NaiveDate;

    fn store() -> (MemoryStaffingStore, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let store = MemoryStaffingStore::new(audit.clone());
        store.add_plan("ql_2024", true);
        for (position, cost_center) in [("posto_ti_01", "cc_ti"), ("posto_rh_01", "cc_rh")] {
            store.insert_row(StaffingRow {
                key: RowKey::new("ql_2024", position, "cargo_analista"),
                cost_center_id: cost_center.to_string(),
                planned: 3,
                actual: 1,
                reserved: 0,
                active: true,
                control_start_date: None,
                updated_at: Utc::now(),
            });
        }
        store.insert_assignment(Assignment {
            employee_id: "col_010".to_string(),
            row: RowKey::new("ql_2024", "posto_ti_01", "cargo_analista"),
            hire_date: NaiveDate::from_ymd_opt(2023, 1, 10).unwrap(),
            active: true,
            released_on: None,
        });
        (store, audit)
    }

    fn transfer(dedup_key: &str, to: &str, expected: Option<RowKey>) -> StaffingMutation {
        let source = RowKey::new("ql_2024", "posto_ti_01", "cargo_analista");
        let dest = RowKey::new("ql_2024", to, "cargo_analista");
        StaffingMutation {
            plan_id: "ql_2024".to_string(),
            deltas: vec![
                RowDelta {
                    key: source,
                    delta: -1,
                },
                RowDelta {
                    key: dest.clone(),
                    delta: 1,
                },
            ],
            expected_assignment: expected,
            assignment: Assignment {
                employee_id: "col_010".to_string(),
                row: dest,
                hire_date: NaiveDate::from_ymd_opt(2023, 1, 10).unwrap(),
                active: true,
                released_on: None,
            },
            dedup_key: dedup_key.to_string(),
            event_kind: "transfer".to_string(),
            audit: AuditEntry::new(AuditAction::EventApplied, "employee", "col_010"),
        }
    }

    #[tokio::test]
    async fn test_transfer_is_all_or_nothing() {
        let (store, audit) = store();
        let expected = Some(RowKey::new("ql_2024", "posto_ti_01", "cargo_analista"));

        let err = store
            .apply_mutation(transfer("k1", "posto_inexistente", expected.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StaffingError::RowNotFound(_)));

        let rows = store.rows();
        assert!(rows.iter().all(|r| r.actual == 1));
        assert_eq!(store.ledger_len(), 0);
        assert_eq!(audit.count(AuditAction::EventApplied), 0);

        let outcome = store
            .apply_mutation(transfer("k1", "posto_rh_01", expected))
            .await
            .unwrap();
        let MutationOutcome::Applied { before, after } = outcome else {
            panic!("expected applied");
        };
        let sum = |rows: &[StaffingRow]| rows.iter().map(|r| r.actual).sum::<i32>();
        assert_eq!(sum(&before), sum(&after));
        assert_eq!(audit.count(AuditAction::EventApplied), 1);
        assert!(audit.entries()[0].before.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_key_is_noop() {
        let (store, _) = store();
        let expected = Some(RowKey::new("ql_2024", "posto_ti_01", "cargo_analista"));
        store
            .apply_mutation(transfer("k1", "posto_rh_01", expected))
            .await
            .unwrap();

        let again = store
            .apply_mutation(transfer(
                "k1",
                "posto_rh_01",
                Some(RowKey::new("ql_2024", "posto_rh_01", "cargo_analista")),
            ))
            .await
            .unwrap();
        assert_eq!(again, MutationOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_stale_assignment_rejected() {
        let (store, _) = store();
        let err = store
            .apply_mutation(transfer("k1", "posto_rh_01", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StaffingError::StaleAssignment(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_batch_update_skips_changed_rows() {
        let (store, _) = store();
        let updates = vec![
            ActualUpdate {
                key: RowKey::new("ql_2024", "posto_ti_01", "cargo_analista"),
                expected_actual: 1,
                actual: 2,
            },
            ActualUpdate {
                key: RowKey::new("ql_2024", "posto_rh_01", "cargo_analista"),
                expected_actual: 5,
                actual: 0,
            },
        ];
        let written = store
            .batch_update_actual(
                "ql_2024",
                &updates,
                AuditEntry::new(AuditAction::BulkNormalization, "staffing_plan", "ql_2024"),
            )
            .await
            .unwrap();
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn test_purge_ledger() {
        let (store, _) = store();
        let expected = Some(RowKey::new("ql_2024", "posto_ti_01", "cargo_analista"));
        store
            .apply_mutation(transfer("k1", "posto_rh_01", expected))
            .await
            .unwrap();
        let purged = store
            .purge_processed_events(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.ledger_len(), 0);
    }
}
