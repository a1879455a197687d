// src/routes/health.rs
//! API health check endpoint for the envwatch service.
//!
//! This module defines the `/health` route used by container orchestrators
//! (e.g., Docker, Kubernetes) and CI pipelines to verify that the service is
//! running. It is a sibling module in the `routes` directory and follows the
//! Explicit Module Boundary Pattern (EMBP):
//! - Internal to this file: endpoint handler(s)
//! - Exports to the gateway (`mod.rs`): a subrouter containing the `/health` route
//!
//! Besides liveness, the response carries the pipeline's degradation
//! signal: `degraded` while alert writes are waiting for the store.

use axum::http::StatusCode;
use axum::{extract::State, routing::get, Json, Router};

use super::AppState;
use crate::events::HealthReport;

/// Handle `GET /health`.
///
/// Returns `200` with `status: "ok"`, or `503` with `status: "degraded"`
/// and the pending write count when persistence is failing. Does not touch
/// the database.
async fn health(State(monitor): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    // ---
    let report = monitor.health();
    let status = if report.degraded_since.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
