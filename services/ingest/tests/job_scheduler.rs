//! Reprocessing and normalization jobs driven through the API and scheduler.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::{admission, TestApp, PLAN};
use lotacao_id::{JobId, WebhookEventId};
use lotacao_ingest::audit::AuditAction;
use lotacao_ingest::jobs::{JobKind, JobStore};
use lotacao_ingest::notify::Notification;
use lotacao_ingest::staffing::{RowKey, StaffingRow};
use rstest::rstest;
use serde_json::json;

async fn queue_failed_delivery(app: &TestApp, employee_id: &str) -> String {
    let (status, body) = app
        .deliver(
            "colaborador-admitido",
            &admission(employee_id, "cargo_dev", "cc_ti"),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_persistent_failure_exhausts_job_attempts() {
    let app = TestApp::new();
    let before = app.total_actual();
    app.flaky.fail_always();

    let job_id = queue_failed_delivery(&app, "col_900").await;
    assert_eq!(app.flaky.apply_calls(), 3);

    assert_eq!(app.state.scheduler().run_pending().await, 3);

    let (status, job) = app.get_json(&format!("/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "failed");
    assert_eq!(job["attempts"], 3);
    assert!(job["error"].as_str().unwrap().contains("connection reset"));
    assert!(job["finished_at"].is_string());

    // One apply per job attempt on top of the inline retries.
    assert_eq!(app.flaky.apply_calls(), 6);
    assert_eq!(app.total_actual(), before);
    assert_eq!(app.audit.count(AuditAction::JobRetry), 2);
    assert_eq!(app.audit.count(AuditAction::JobFailed), 1);
    assert!(matches!(
        app.notifier.sent().as_slice(),
        [Notification::JobFailed { kind: JobKind::WebhookRetry, attempts: 3, .. }]
    ));

    // Nothing left to claim.
    assert_eq!(app.state.scheduler().run_pending().await, 0);
}

#[tokio::test]
async fn test_job_recovers_after_transient_outage() {
    let app = TestApp::new();
    let before = app.total_actual();
    app.flaky.fail_next(3);

    let job_id = queue_failed_delivery(&app, "col_901").await;
    assert_eq!(app.total_actual(), before);

    assert_eq!(app.state.scheduler().run_pending().await, 1);

    let (_, job) = app.get_json(&format!("/v1/jobs/{job_id}")).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["attempts"], 1);
    assert_eq!(job["result"]["status"], "applied");
    assert_eq!(job["result"]["employee_id"], "col_901");
    assert_eq!(app.actual("posto_ti_01", "cargo_dev"), 2);
    assert_eq!(app.total_actual(), before + 1);
    assert!(app.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_manual_reprocess_of_applied_event_is_noop() {
    let app = TestApp::new();
    let (status, body) = app
        .deliver(
            "colaborador-admitido",
            &admission("col_902", "cargo_dev", "cc_ti"),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let before = app.total_actual();

    let (status, job) = app
        .post_json(
            "/v1/jobs/reprocess",
            &json!({ "event_id": body["event_id"], "priority": 5 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["priority"], 5);
    assert_eq!(job["max_attempts"], 3);

    assert_eq!(app.state.scheduler().run_pending().await, 1);
    let (_, job) = app
        .get_json(&format!("/v1/jobs/{}", job["id"].as_str().unwrap()))
        .await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["status"], "already_applied");
    assert_eq!(app.total_actual(), before);
}

#[rstest]
#[case("cargo_analista", "cc_rh", "exigir_aprovacao")]
#[case("cargo_dev", "cc_marketing", "bloquear")]
#[tokio::test]
async fn test_reprocess_cannot_bypass_admission_policy(
    #[case] role: &str,
    #[case] cost_center: &str,
    #[case] action: &str,
) {
    let app = TestApp::new();
    let before = app.staffing.rows();

    let (status, body) = app
        .deliver("colaborador-admitido", &admission("col_903", role, cost_center))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["action"], action);

    let (status, job) = app
        .post_json("/v1/jobs/reprocess", &json!({ "event_id": body["event_id"] }))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    assert_eq!(app.state.scheduler().run_pending().await, 1);

    let (_, job) = app
        .get_json(&format!("/v1/jobs/{}", job["id"].as_str().unwrap()))
        .await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["attempts"], 1);
    assert!(job["error"].as_str().unwrap().contains(action));
    assert_eq!(app.staffing.rows(), before);
    assert_eq!(app.flaky.apply_calls(), 0);
}

#[tokio::test]
async fn test_reprocess_request_validation() {
    let app = TestApp::new();

    let (status, problem) = app
        .post_json("/v1/jobs/reprocess", &json!({ "event_id": "not-an-id" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "invalid_event_id");

    let unknown = WebhookEventId::new().to_string();
    let (status, problem) = app
        .post_json("/v1/jobs/reprocess", &json!({ "event_id": unknown }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["code"], "event_not_found");
    assert!(app.jobs.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_normalize_job_repairs_drifted_row() {
    let app = TestApp::new();
    let drifted = StaffingRow {
        actual: 5,
        ..app.row("posto_ti_01", "cargo_dev")
    };
    app.staffing.insert_row(drifted);

    let (status, job) = app
        .post_json("/v1/jobs/normalize", &json!({ "cost_center_ids": ["cc_ti"] }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["kind"], "bulk_normalization");
    assert_eq!(job["payload"]["type"], "bulk_normalization");

    assert_eq!(app.state.scheduler().run_pending().await, 1);

    let (_, job) = app
        .get_json(&format!("/v1/jobs/{}", job["id"].as_str().unwrap()))
        .await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["plan_id"], PLAN);
    assert_eq!(job["result"]["rows_scanned"], 2);
    assert_eq!(job["result"]["rows_corrected"], 1);
    assert_eq!(
        job["result"]["corrections"][0]["key"],
        json!(RowKey::new(PLAN, "posto_ti_01", "cargo_dev"))
    );
    assert_eq!(app.actual("posto_ti_01", "cargo_dev"), 1);
    assert_eq!(app.audit.count(AuditAction::BulkNormalization), 1);
    assert!(!app.cache.patterns().is_empty());
}

#[tokio::test]
async fn test_normalize_rejects_inverted_date_range() {
    let app = TestApp::new();
    let (status, problem) = app
        .post_json(
            "/v1/jobs/normalize",
            &json!({ "hired_from": "2024-06-01", "hired_to": "2024-01-01" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "invalid_date_range");
    assert_eq!(problem["details"][0]["field"], "hired_from");
}

#[tokio::test]
async fn test_higher_priority_claimed_first() {
    let app = TestApp::new();
    let (_, low) = app
        .post_json("/v1/jobs/normalize", &json!({ "priority": 1 }))
        .await;
    let (_, high) = app
        .post_json("/v1/jobs/normalize", &json!({ "priority": 10 }))
        .await;

    let first = app.jobs.claim_next(Utc::now()).await.unwrap().unwrap();
    let second = app.jobs.claim_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(first.id.to_string(), high["id"].as_str().unwrap());
    assert_eq!(second.id.to_string(), low["id"].as_str().unwrap());
    assert_eq!(first.attempts, 1);
    assert!(app.jobs.claim_next(Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let app = TestApp::new();
    let (_, job) = app.post_json("/v1/jobs/normalize", &json!({})).await;
    let id = job["id"].as_str().unwrap().to_string();

    let (status, cancelled) = app
        .post_json(&format!("/v1/jobs/{id}/cancel"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(app.audit.count(AuditAction::JobCancelled), 1);

    let (status, problem) = app
        .post_json(&format!("/v1/jobs/{id}/cancel"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["code"], "job_not_pending");
    assert_eq!(problem["status"], 409);

    // A cancelled job never runs.
    assert_eq!(app.state.scheduler().run_pending().await, 0);

    let unknown = JobId::new();
    let (status, problem) = app
        .post_json(&format!("/v1/jobs/{unknown}/cancel"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["code"], "job_not_found");

    let (status, _) = app.get_json("/v1/jobs/not-a-job").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_jobs_by_status() {
    let app = TestApp::new();
    app.post_json("/v1/jobs/normalize", &json!({})).await;
    let (_, second) = app.post_json("/v1/jobs/normalize", &json!({})).await;
    let id = second["id"].as_str().unwrap();
    app.post_json(&format!("/v1/jobs/{id}/cancel"), &json!({}))
        .await;

    let (status, all) = app.get_json("/v1/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all["items"].as_array().unwrap().len(), 2);

    let (_, pending) = app.get_json("/v1/jobs?status=pending").await;
    assert_eq!(pending["items"].as_array().unwrap().len(), 1);

    let (_, cancelled) = app.get_json("/v1/jobs?status=cancelled").await;
    assert_eq!(cancelled["items"][0]["id"], second["id"]);

    let (status, problem) = app.get_json("/v1/jobs?status=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "invalid_status");
}
