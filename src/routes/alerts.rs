//! Alert listing, summary and acknowledgement endpoints.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::alerts::{AlertQuery, AlertSummary};
use crate::error::MonitorError;
use crate::models::Alert;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/alerts", get(list))
        .route("/api/alerts/summary", get(summary))
        .route("/api/alerts/{id}", get(show))
        .route("/api/alerts/{id}/acknowledge", post(acknowledge))
}

async fn list(State(monitor): State<AppState>, Query(query): Query<AlertQuery>) -> Json<Vec<Alert>> {
    Json(monitor.alerts(&query))
}

async fn summary(State(monitor): State<AppState>) -> Json<AlertSummary> {
    Json(monitor.alert_summary(Utc::now()))
}

async fn show(
    State(monitor): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alert>, MonitorError> {
    monitor.alert(id).map(Json)
}

/// `POST /api/alerts/{id}/acknowledge`
async fn acknowledge(
    State(monitor): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alert>, MonitorError> {
    // ---
    info!("POST /api/alerts/{}/acknowledge", id);
    let alert = monitor.acknowledge(id, Utc::now()).await?;
    Ok(Json(alert))
}
