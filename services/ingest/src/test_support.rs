//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use chrono::{NaiveDate, TimeZone, Utc};
use lotacao_events::{ColaboradorEvent, EmployeeChange, EmployeeStatus};

use crate::audit::MemoryAuditLog;
use crate::cache::RecordingCache;
use crate::normalization::{ApplyContext, ApplyOutcome, EventApplier, NormalizationError};
use crate::staffing::{Assignment, MemoryStaffingStore, RowKey, StaffingRepository, StaffingRow};

pub const PLAN: &str = "ql_2024";

pub struct Fixture {
    pub store: Arc<MemoryStaffingStore>,
    pub audit: Arc<MemoryAuditLog>,
    pub cache: Arc<RecordingCache>,
    pub repo: StaffingRepository,
}

impl Fixture {
    pub fn row(&self, position: &str, role: &str) -> StaffingRow {
        let key = RowKey::new(PLAN, position, role);
        self.store
            .rows()
            .into_iter()
            .find(|r| r.key == key)
            .unwrap_or_else(|| panic!("row {key} not seeded"))
    }

    pub fn total_actual(&self) -> i32 {
        self.store.rows().iter().map(|r| r.actual).sum()
    }
}

pub fn row(position: &str, cost_center: &str, role: &str, planned: i32, actual: i32) -> StaffingRow {
    StaffingRow {
        key: RowKey::new(PLAN, position, role),
        cost_center_id: cost_center.to_string(),
        planned,
        actual,
        reserved: 0,
        active: true,
        control_start_date: None,
        updated_at: Utc::now(),
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// A plan with three cost centers:
///
/// - cc_ti: posto_ti_01 cargo_dev (2 planned, col_100 assigned), posto_ti_02
///   cargo_dev (1 planned, empty), posto_ti_03 cargo_dev_senior (1 planned)
/// - cc_rh: posto_rh_01 cargo_dev (1 planned), posto_rh_02 cargo_analista
///   (1 planned, col_200 assigned, full)
/// - cc_fin: posto_fin_01 cargo_dev, inactive
pub fn fixture() -> Fixture {
    let audit = Arc::new(MemoryAuditLog::new());
    let store = Arc::new(MemoryStaffingStore::new(audit.clone()));
    store.add_plan("ql_2023", false);
    store.add_plan(PLAN, true);

    store.insert_row(row("posto_ti_01", "cc_ti", "cargo_dev", 2, 1));
    store.insert_row(row("posto_ti_02", "cc_ti", "cargo_dev", 1, 0));
    store.insert_row(row("posto_ti_03", "cc_ti", "cargo_dev_senior", 1, 0));
    store.insert_row(row("posto_rh_01", "cc_rh", "cargo_dev", 1, 0));
    store.insert_row(row("posto_rh_02", "cc_rh", "cargo_analista", 1, 1));
    let mut inactive = row("posto_fin_01", "cc_fin", "cargo_dev", 1, 0);
    inactive.active = false;
    store.insert_row(inactive);

    store.insert_assignment(Assignment {
        employee_id: "col_100".to_string(),
        row: RowKey::new(PLAN, "posto_ti_01", "cargo_dev"),
        hire_date: date(2022, 5, 2),
        active: true,
        released_on: None,
    });
    store.insert_assignment(Assignment {
        employee_id: "col_200".to_string(),
        row: RowKey::new(PLAN, "posto_rh_02", "cargo_analista"),
        hire_date: date(2024, 2, 1),
        active: true,
        released_on: None,
    });

    let cache = Arc::new(RecordingCache::new());
    let repo = StaffingRepository::new(store.clone(), cache.clone());
    Fixture {
        store,
        audit,
        cache,
        repo,
    }
}

pub fn event(
    employee_id: &str,
    role_id: &str,
    cost_center_id: &str,
    change: EmployeeChange,
) -> ColaboradorEvent {
    ColaboradorEvent {
        employee_id: employee_id.to_string(),
        name: "Ana Lima".to_string(),
        national_id: "52998224725".to_string(),
        role_id: role_id.to_string(),
        cost_center_id: cost_center_id.to_string(),
        position_id: None,
        shift: "diurno".to_string(),
        hire_date: date(2024, 3, 1),
        has_disability: false,
        status: EmployeeStatus::Active,
        occurred_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        change,
    }
}

pub fn admission(employee_id: &str, role_id: &str, cost_center_id: &str) -> ColaboradorEvent {
    event(employee_id, role_id, cost_center_id, EmployeeChange::Admission)
}

/// Applier that replays a fixed script of results.
#[derive(Default)]
pub struct ScriptedApplier {
    script: Mutex<VecDeque<Result<ApplyOutcome, NormalizationError>>>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl ScriptedApplier {
    /// Results are returned in order; once the script is exhausted every
    /// call succeeds.
    pub fn new(script: Vec<Result<ApplyOutcome, NormalizationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventApplier for ScriptedApplier {
    async fn apply(
        &self,
        _event: &ColaboradorEvent,
        _ctx: &ApplyContext,
    ) -> Result<ApplyOutcome, NormalizationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or(Ok(ApplyOutcome::Applied { deltas: Vec::new() }))
    }
}
