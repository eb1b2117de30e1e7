//! API v1 routes.

mod jobs;
mod proposals;
mod webhooks;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/webhooks", webhooks::routes())
        .merge(jobs::routes())
        .merge(proposals::routes())
}
