//! HR system webhook endpoints.
//!
//! The body is taken as raw bytes so the signature is checked against
//! exactly what was sent.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use lotacao_events::EventKind;

use crate::api::request_context;
use crate::gateway::SIGNATURE_HEADER;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/colaborador-admitido", post(employee_admitted))
        .route("/colaborador-transferido", post(employee_transferred))
        .route("/colaborador-desligado", post(employee_terminated))
        .route("/colaborador-promovido", post(employee_promoted))
}

/// POST /v1/webhooks/colaborador-admitido
async fn employee_admitted(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    deliver(state, EventKind::Admission, headers, body).await
}

/// POST /v1/webhooks/colaborador-transferido
async fn employee_transferred(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    deliver(state, EventKind::Transfer, headers, body).await
}

/// POST /v1/webhooks/colaborador-desligado
async fn employee_terminated(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    deliver(state, EventKind::Termination, headers, body).await
}

/// POST /v1/webhooks/colaborador-promovido
async fn employee_promoted(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    deliver(state, EventKind::Promotion, headers, body).await
}

async fn deliver(state: AppState, kind: EventKind, headers: HeaderMap, body: Bytes) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let request_id = request_context::request_id(&headers);

    let response = state
        .gateway()
        .handle(kind, signature, &body, Some(request_id))
        .await;

    (response.status, Json(response.reply)).into_response()
}
