//! HTTP route handlers for the admin API.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                               - Liveness check
//! GET  /health/ready                         - Readiness check (pings the database)
//!
//! # Newsletters (admin)
//! GET    /api/admin/newsletters              - List newsletters
//! POST   /api/admin/newsletters              - Create a draft
//! GET    /api/admin/newsletters/stats        - Aggregate send statistics
//! GET    /api/admin/newsletters/{id}         - Fetch one newsletter
//! PATCH  /api/admin/newsletters/{id}         - Partial update
//! DELETE /api/admin/newsletters/{id}         - Delete (with send history)
//! POST   /api/admin/newsletters/{id}/send    - Send now or confirm the schedule
//! ```

pub mod newsletters;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Build the full application router.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .nest("/api/admin/newsletters", newsletters::router())
}

/// Liveness health check endpoint.
///
/// Returns "ok" if the server is running. Does not check dependencies.
async fn health() -> &'static str {
    "ok"
}

/// Readiness health check endpoint.
///
/// Verifies database connectivity before returning OK.
/// Returns 503 Service Unavailable if the database is not reachable.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").fetch_one(state.pool()).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
