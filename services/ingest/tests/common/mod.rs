//! Shared harness for the ingest integration tests.
//!
//! Builds the full router over in-memory stores seeded with a small plan and
//! drives it in-process.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use lotacao_ingest::{
    api,
    audit::{AuditEntry, MemoryAuditLog},
    cache::RecordingCache,
    gateway::{signature, SIGNATURE_HEADER},
    inbox::MemoryWebhookEventStore,
    jobs::{MemoryJobStore, SchedulerConfig},
    notify::MemoryNotifier,
    proposals::MemoryProposalStore,
    resolver::RuleTable,
    retry::RetryPolicy,
    staffing::{
        ActualUpdate, Assignment, MemoryStaffingStore, MutationOutcome, RowFilter, RowKey,
        RowPatch, StaffingError, StaffingMutation, StaffingRow, StaffingStore,
    },
    state::{AppState, StateOptions, Stores},
};
use serde_json::{json, Value};
use tower::ServiceExt;

pub const SECRET: &str = "whsec_integration";
pub const PLAN: &str = "ql_2024";

/// Staffing store that fails `apply_mutation` a configurable number of
/// times with a transient error before delegating.
pub struct FlakyStore {
    inner: Arc<MemoryStaffingStore>,
    failures_left: AtomicU32,
    apply_calls: AtomicU32,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStaffingStore>) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(0),
            apply_calls: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.fail_next(u32::MAX);
    }

    pub fn apply_calls(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StaffingStore for FlakyStore {
    async fn active_plan_id(&self) -> Result<Option<String>, StaffingError> {
        self.inner.active_plan_id().await
    }

    async fn get_row(&self, key: &RowKey) -> Result<Option<StaffingRow>, StaffingError> {
        self.inner.get_row(key).await
    }

    async fn list_rows(&self, filter: &RowFilter) -> Result<Vec<StaffingRow>, StaffingError> {
        self.inner.list_rows(filter).await
    }

    async fn get_assignment(
        &self,
        employee_id: &str,
    ) -> Result<Option<Assignment>, StaffingError> {
        self.inner.get_assignment(employee_id).await
    }

    async fn list_assignments(&self, plan_id: &str) -> Result<Vec<Assignment>, StaffingError> {
        self.inner.list_assignments(plan_id).await
    }

    async fn is_processed(&self, dedup_key: &str) -> Result<bool, StaffingError> {
        self.inner.is_processed(dedup_key).await
    }

    async fn apply_mutation(
        &self,
        mutation: StaffingMutation,
    ) -> Result<MutationOutcome, StaffingError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(StaffingError::Unavailable("connection reset".to_string()));
        }
        self.inner.apply_mutation(mutation).await
    }

    async fn update_row(
        &self,
        key: &RowKey,
        patch: &RowPatch,
        audit: AuditEntry,
    ) -> Result<StaffingRow, StaffingError> {
        self.inner.update_row(key, patch, audit).await
    }

    async fn batch_update_actual(
        &self,
        plan_id: &str,
        updates: &[ActualUpdate],
        audit: AuditEntry,
    ) -> Result<u64, StaffingError> {
        self.inner.batch_update_actual(plan_id, updates, audit).await
    }

    async fn purge_processed_events(&self, cutoff: DateTime<Utc>) -> Result<u64, StaffingError> {
        self.inner.purge_processed_events(cutoff).await
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub staffing: Arc<MemoryStaffingStore>,
    pub flaky: Arc<FlakyStore>,
    pub audit: Arc<MemoryAuditLog>,
    pub webhooks: Arc<MemoryWebhookEventStore>,
    pub proposals: Arc<MemoryProposalStore>,
    pub jobs: Arc<MemoryJobStore>,
    pub notifier: Arc<MemoryNotifier>,
    pub cache: Arc<RecordingCache>,
}

impl TestApp {
    /// Seeded app with no waiting between retries.
    ///
    /// Plan `ql_2024`:
    /// - cc_ti: posto_ti_01 cargo_dev (2 planned, col_100), posto_ti_02
    ///   cargo_dev (1 planned)
    /// - cc_rh: posto_rh_01 cargo_dev (1 planned), posto_rh_02 cargo_analista
    ///   (1 planned, col_200, full)
    pub fn new() -> Self {
        let audit = Arc::new(MemoryAuditLog::new());
        let staffing = Arc::new(MemoryStaffingStore::new(audit.clone()));
        seed(&staffing);

        let flaky = Arc::new(FlakyStore::new(staffing.clone()));
        let webhooks = Arc::new(MemoryWebhookEventStore::new());
        let proposals = Arc::new(MemoryProposalStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let cache = Arc::new(RecordingCache::new());

        let stores = Stores {
            staffing: flaky.clone(),
            audit: audit.clone(),
            webhooks: webhooks.clone(),
            proposals: proposals.clone(),
            jobs: jobs.clone(),
            cache: cache.clone(),
            notifier: notifier.clone(),
        };
        let options = StateOptions {
            webhook_secret: SECRET.to_string(),
            retry: RetryPolicy::immediate(3),
            scheduler: SchedulerConfig {
                backoff: RetryPolicy::immediate(3),
                ..SchedulerConfig::default()
            },
            job_max_attempts: 3,
            rules: RuleTable::default(),
        };
        let state = AppState::new(stores, options, None);
        let router = api::create_router(state.clone());

        Self {
            router,
            state,
            staffing,
            flaky,
            audit,
            webhooks,
            proposals,
            jobs,
            notifier,
            cache,
        }
    }

    pub fn row(&self, position: &str, role: &str) -> StaffingRow {
        let key = RowKey::new(PLAN, position, role);
        self.staffing
            .rows()
            .into_iter()
            .find(|r| r.key == key)
            .unwrap_or_else(|| panic!("row {key} not seeded"))
    }

    pub fn actual(&self, position: &str, role: &str) -> i32 {
        self.row(position, role).actual
    }

    pub fn total_actual(&self) -> i32 {
        self.staffing.rows().iter().map(|r| r.actual).sum()
    }

    /// Signs and posts a webhook document.
    pub async fn deliver(&self, endpoint: &str, body: &Value) -> (StatusCode, Value) {
        let bytes = serde_json::to_vec(body).unwrap();
        let signature = signature::sign(SECRET.as_bytes(), &bytes).unwrap();
        self.post_raw(&format!("/v1/webhooks/{endpoint}"), bytes, Some(&signature))
            .await
    }

    pub async fn post_raw(
        &self,
        path: &str,
        body: Vec<u8>,
        signature: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        self.send(request.body(Body::from(body)).unwrap()).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header("authorization", "Bearer operator:ana")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        self.send(request).await
    }

    pub async fn get_json(&self, path: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

fn seed(store: &MemoryStaffingStore) {
    store.add_plan("ql_2023", false);
    store.add_plan(PLAN, true);

    store.insert_row(row("posto_ti_01", "cc_ti", "cargo_dev", 2, 1));
    store.insert_row(row("posto_ti_02", "cc_ti", "cargo_dev", 1, 0));
    store.insert_row(row("posto_rh_01", "cc_rh", "cargo_dev", 1, 0));
    store.insert_row(row("posto_rh_02", "cc_rh", "cargo_analista", 1, 1));

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
}

fn row(position: &str, cost_center: &str, role: &str, planned: i32, actual: i32) -> StaffingRow {
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

fn document(event: &str, data: Value) -> Value {
    json!({
        "event": event,
        "timestamp": "2024-03-01T12:00:00Z",
        "data": data,
    })
}

fn employee(employee_id: &str, role_id: &str, cost_center_id: &str) -> Value {
    json!({
        "employee_id": employee_id,
        "name": "Ana Lima",
        "national_id": "529.982.247-25",
        "role_id": role_id,
        "cost_center_id": cost_center_id,
        "shift": "diurno",
        "hire_date": "2024-03-01",
        "has_disability": false,
        "status": "ativo"
    })
}

pub fn admission(employee_id: &str, role_id: &str, cost_center_id: &str) -> Value {
    document(
        "colaborador.admitido",
        employee(employee_id, role_id, cost_center_id),
    )
}

pub fn transfer(
    employee_id: &str,
    role_id: &str,
    cost_center_id: &str,
    previous_cost_center_id: &str,
) -> Value {
    let mut data = employee(employee_id, role_id, cost_center_id);
    data["previous_cost_center_id"] = json!(previous_cost_center_id);
    document("colaborador.transferido", data)
}

pub fn termination(employee_id: &str, role_id: &str, cost_center_id: &str) -> Value {
    let mut data = employee(employee_id, role_id, cost_center_id);
    data["status"] = json!("desligado");
    data["termination_date"] = json!("2024-03-01");
    document("colaborador.desligado", data)
}

pub fn promotion(
    employee_id: &str,
    role_id: &str,
    cost_center_id: &str,
    previous_role_id: &str,
) -> Value {
    let mut data = employee(employee_id, role_id, cost_center_id);
    data["previous_role_id"] = json!(previous_role_id);
    document("colaborador.promovido", data)
}
