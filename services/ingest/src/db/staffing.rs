//! Postgres staffing store.
//!
//! Mutations run in one transaction: the ledger key is inserted first (a
//! conflict means the event was already applied), then the assignment and
//! every touched row are locked in key order, updated, and audited before
//! commit. Locking in key order keeps concurrent transfers between the same
//! two rows from deadlocking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use super::audit::insert_entry;
use super::DbError;
use crate::audit::AuditEntry;
use crate::staffing::{
    ActualUpdate, Assignment, MutationOutcome, RowFilter, RowKey, RowPatch, StaffingError,
    StaffingMutation, StaffingRow, StaffingStore,
};

const ROW_COLUMNS: &str = "plan_id, position_id, role_id, cost_center_id, planned, actual, \
     reserved, active, control_start_date, updated_at";

const ASSIGNMENT_COLUMNS: &str =
    "employee_id, plan_id, position_id, role_id, hire_date, active, released_on";

impl<'r> sqlx::FromRow<'r, PgRow> for StaffingRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            key: RowKey {
                plan_id: row.try_get("plan_id")?,
                position_id: row.try_get("position_id")?,
                role_id: row.try_get("role_id")?,
            },
            cost_center_id: row.try_get("cost_center_id")?,
            planned: row.try_get("planned")?,
            actual: row.try_get("actual")?,
            reserved: row.try_get("reserved")?,
            active: row.try_get("active")?,
            control_start_date: row.try_get("control_start_date")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Assignment {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            employee_id: row.try_get("employee_id")?,
            row: RowKey {
                plan_id: row.try_get("plan_id")?,
                position_id: row.try_get("position_id")?,
                role_id: row.try_get("role_id")?,
            },
            hire_date: row.try_get("hire_date")?,
            active: row.try_get("active")?,
            released_on: row.try_get("released_on")?,
        })
    }
}

/// Staffing tables backed by Postgres.
#[derive(Clone)]
pub struct PgStaffingStore {
    pool: PgPool,
}

impl PgStaffingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, DbError> {
        self.pool.begin().await.map_err(DbError::Query)
    }

    async fn lock_row(
        tx: &mut Transaction<'static, Postgres>,
        key: &RowKey,
    ) -> Result<Option<StaffingRow>, DbError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM staffing_rows \
             WHERE plan_id = $1 AND position_id = $2 AND role_id = $3 \
             FOR UPDATE"
        );
        sqlx::query_as::<_, StaffingRow>(&sql)
            .bind(&key.plan_id)
            .bind(&key.position_id)
            .bind(&key.role_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::Query)
    }

    async fn write_actual(
        tx: &mut Transaction<'static, Postgres>,
        key: &RowKey,
        actual: i32,
    ) -> Result<StaffingRow, DbError> {
        let sql = format!(
            "UPDATE staffing_rows SET actual = $4, updated_at = now() \
             WHERE plan_id = $1 AND position_id = $2 AND role_id = $3 \
             RETURNING {ROW_COLUMNS}"
        );
        sqlx::query_as::<_, StaffingRow>(&sql)
            .bind(&key.plan_id)
            .bind(&key.position_id)
            .bind(&key.role_id)
            .bind(actual)
            .fetch_one(&mut **tx)
            .await
            .map_err(DbError::Query)
    }
}

#[async_trait]
impl StaffingStore for PgStaffingStore {
    async fn active_plan_id(&self) -> Result<Option<String>, StaffingError> {
        let plan_id: Option<String> =
            sqlx::query_scalar("SELECT plan_id FROM staffing_plans WHERE active LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::Query)?;
        Ok(plan_id)
    }

    async fn get_row(&self, key: &RowKey) -> Result<Option<StaffingRow>, StaffingError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM staffing_rows \
             WHERE plan_id = $1 AND position_id = $2 AND role_id = $3"
        );
        let row = sqlx::query_as::<_, StaffingRow>(&sql)
            .bind(&key.plan_id)
            .bind(&key.position_id)
            .bind(&key.role_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(row)
    }

    async fn list_rows(&self, filter: &RowFilter) -> Result<Vec<StaffingRow>, StaffingError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM staffing_rows \
             WHERE plan_id = $1 \
               AND ($2::text[] IS NULL OR cost_center_id = ANY($2)) \
               AND ($3::text IS NULL OR position_id = $3) \
               AND ($4::text IS NULL OR role_id = $4) \
               AND (NOT $5 OR active) \
             ORDER BY plan_id, position_id, role_id"
        );
        let rows = sqlx::query_as::<_, StaffingRow>(&sql)
            .bind(&filter.plan_id)
            .bind(filter.cost_center_ids.as_deref())
            .bind(filter.position_id.as_deref())
            .bind(filter.role_id.as_deref())
            .bind(filter.active_only)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(rows)
    }

    async fn get_assignment(
        &self,
        employee_id: &str,
    ) -> Result<Option<Assignment>, StaffingError> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM staffing_assignments WHERE employee_id = $1"
        );
        let assignment = sqlx::query_as::<_, Assignment>(&sql)
            .bind(employee_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(assignment)
    }

    async fn list_assignments(&self, plan_id: &str) -> Result<Vec<Assignment>, StaffingError> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM staffing_assignments \
             WHERE plan_id = $1 ORDER BY employee_id"
        );
        let assignments = sqlx::query_as::<_, Assignment>(&sql)
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(assignments)
    }

    async fn is_processed(&self, dedup_key: &str) -> Result<bool, StaffingError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM processed_events WHERE dedup_key = $1)",
        )
        .bind(dedup_key)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(exists)
    }

    async fn apply_mutation(
        &self,
        mutation: StaffingMutation,
    ) -> Result<MutationOutcome, StaffingError> {
        let mut tx = self.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_events (dedup_key, employee_id, event_kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(&mutation.dedup_key)
        .bind(&mutation.assignment.employee_id)
        .bind(&mutation.event_kind)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?
        .rows_affected();

        if inserted == 0 {
            debug!(dedup_key = %mutation.dedup_key, "Event already in ledger");
            tx.rollback().await.map_err(DbError::Query)?;
            return Ok(MutationOutcome::Duplicate);
        }

        let employee_id = &mutation.assignment.employee_id;
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM staffing_assignments \
             WHERE employee_id = $1 FOR UPDATE"
        );
        let current = sqlx::query_as::<_, Assignment>(&sql)
            .bind(employee_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::Query)?
            .filter(|a| a.active)
            .map(|a| a.row);
        if current != mutation.expected_assignment {
            return Err(StaffingError::StaleAssignment(employee_id.clone()));
        }

        let mut keys: Vec<&RowKey> = mutation.deltas.iter().map(|d| &d.key).collect();
        keys.sort();
        keys.dedup();

        let mut before = Vec::with_capacity(keys.len());
        let mut after = Vec::with_capacity(keys.len());
        for key in keys {
            let row = Self::lock_row(&mut tx, key)
                .await?
                .ok_or_else(|| StaffingError::RowNotFound(key.clone()))?;
            let delta: i32 = mutation
                .deltas
                .iter()
                .filter(|d| &d.key == key)
                .map(|d| d.delta)
                .sum();
            let actual = row.actual + delta;
            if actual < 0 {
                return Err(StaffingError::NegativeHeadcount(key.clone()));
            }
            let updated = Self::write_actual(&mut tx, key, actual).await?;
            before.push(row);
            after.push(updated);
        }

        let assignment = &mutation.assignment;
        sqlx::query(
            r#"
            INSERT INTO staffing_assignments (
                employee_id, plan_id, position_id, role_id, hire_date, active, released_on
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (employee_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                position_id = EXCLUDED.position_id,
                role_id = EXCLUDED.role_id,
                hire_date = EXCLUDED.hire_date,
                active = EXCLUDED.active,
                released_on = EXCLUDED.released_on,
                updated_at = now()
            "#,
        )
        .bind(&assignment.employee_id)
        .bind(&assignment.row.plan_id)
        .bind(&assignment.row.position_id)
        .bind(&assignment.row.role_id)
        .bind(assignment.hire_date)
        .bind(assignment.active)
        .bind(assignment.released_on)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        let entry = mutation
            .audit
            .before(serde_json::to_value(&before).map_err(DbError::from)?)
            .after(serde_json::to_value(&after).map_err(DbError::from)?);
        insert_entry(&mut *tx, &entry)
            .await
            .map_err(DbError::Query)?;

        tx.commit().await.map_err(DbError::Query)?;

        Ok(MutationOutcome::Applied { before, after })
    }

    async fn update_row(
        &self,
        key: &RowKey,
        patch: &RowPatch,
        audit: AuditEntry,
    ) -> Result<StaffingRow, StaffingError> {
        let mut tx = self.begin().await?;

        let row = Self::lock_row(&mut tx, key)
            .await?
            .ok_or_else(|| StaffingError::RowNotFound(key.clone()))?;

        let actual = patch.actual.unwrap_or(row.actual);
        if actual < 0 {
            return Err(StaffingError::NegativeHeadcount(key.clone()));
        }

        let sql = format!(
            "UPDATE staffing_rows \
             SET actual = $4, reserved = $5, active = $6, updated_at = now() \
             WHERE plan_id = $1 AND position_id = $2 AND role_id = $3 \
             RETURNING {ROW_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, StaffingRow>(&sql)
            .bind(&key.plan_id)
            .bind(&key.position_id)
            .bind(&key.role_id)
            .bind(actual)
            .bind(patch.reserved.unwrap_or(row.reserved))
            .bind(patch.active.unwrap_or(row.active))
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        let entry = audit
            .before(serde_json::to_value(&row).map_err(DbError::from)?)
            .after(serde_json::to_value(&updated).map_err(DbError::from)?);
        insert_entry(&mut *tx, &entry)
            .await
            .map_err(DbError::Query)?;

        tx.commit().await.map_err(DbError::Query)?;
        Ok(updated)
    }

    async fn batch_update_actual(
        &self,
        plan_id: &str,
        updates: &[ActualUpdate],
        audit: AuditEntry,
    ) -> Result<u64, StaffingError> {
        let positions: Vec<&str> = updates.iter().map(|u| u.key.position_id.as_str()).collect();
        let roles: Vec<&str> = updates.iter().map(|u| u.key.role_id.as_str()).collect();
        let expected: Vec<i32> = updates.iter().map(|u| u.expected_actual).collect();
        let actuals: Vec<i32> = updates.iter().map(|u| u.actual).collect();

        let mut tx = self.begin().await?;

        let sql = format!(
            "UPDATE staffing_rows AS r \
             SET actual = u.actual, updated_at = now() \
             FROM UNNEST($2::text[], $3::text[], $4::int4[], $5::int4[]) \
                  AS u(position_id, role_id, expected_actual, actual) \
             WHERE r.plan_id = $1 \
               AND r.position_id = u.position_id \
               AND r.role_id = u.role_id \
               AND r.actual = u.expected_actual \
             RETURNING {}",
            ROW_COLUMNS
                .split(", ")
                .map(|c| format!("r.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let written = sqlx::query_as::<_, StaffingRow>(&sql)
            .bind(plan_id)
            .bind(&positions)
            .bind(&roles)
            .bind(&expected)
            .bind(&actuals)
            .fetch_all(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        if written.is_empty() {
            tx.rollback().await.map_err(DbError::Query)?;
            return Ok(0);
        }

        let entry = audit
            .before(serde_json::to_value(updates).map_err(DbError::from)?)
            .after(serde_json::to_value(&written).map_err(DbError::from)?);
        insert_entry(&mut *tx, &entry)
            .await
            .map_err(DbError::Query)?;

        tx.commit().await.map_err(DbError::Query)?;
        Ok(written.len() as u64)
    }

    async fn purge_processed_events(&self, cutoff: DateTime<Utc>) -> Result<u64, StaffingError> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }
}
