//! Threshold settings endpoints.
//!
//! Updates are optimistic: the caller sends the version it last read and
//! gets `409 Conflict` if someone else updated the metric in between.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use super::AppState;
use crate::error::MonitorError;
use crate::models::Metric;
use crate::thresholds::{Band, ThresholdConfig};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/thresholds", get(list))
        .route("/api/thresholds/{metric}", get(show).put(update))
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    expected_version: u64,
    bands: Vec<Band>,
}

fn parse_metric(raw: &str) -> Result<Metric, MonitorError> {
    raw.parse().map_err(MonitorError::NotFound)
}

async fn list(State(monitor): State<AppState>) -> Json<Vec<ThresholdConfig>> {
    Json(monitor.thresholds())
}

async fn show(
    State(monitor): State<AppState>,
    Path(metric): Path<String>,
) -> Result<Json<ThresholdConfig>, MonitorError> {
    // ---
    let metric = parse_metric(&metric)?;
    monitor.threshold(metric).map(Json)
}

/// `PUT /api/thresholds/{metric}`
async fn update(
    State(monitor): State<AppState>,
    Path(metric): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<ThresholdConfig>, MonitorError> {
    // ---
    let metric = parse_metric(&metric)?;
    info!(
        "PUT /api/thresholds/{} - expected version {}",
        metric, request.expected_version
    );

    let updated = monitor
        .update_thresholds(metric, request.expected_version, request.bands, Utc::now())
        .await?;
    Ok(Json(updated))
}
