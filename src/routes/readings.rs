//! Telemetry submission and latest-reading endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::AppState;
use crate::models::{Metric, Reading};
use crate::monitor::RecordOutcome;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/readings", post(submit))
        .route("/api/readings/frame", post(submit_frame))
        .route("/api/readings/latest", get(latest))
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    accepted: usize,
    rejected: usize,
    failed: usize,
    outcomes: Vec<RecordOutcome>,
}

impl SubmitResponse {
    fn from_outcomes(outcomes: Vec<RecordOutcome>) -> (StatusCode, Json<Self>) {
        // ---
        let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, RecordOutcome::Failed { .. }))
            .count();
        let rejected = outcomes.len() - accepted - failed;

        // Per-record detail is always in the body; the status only reports
        // the case where nothing at all went through.
        let status = if accepted > 0 || outcomes.is_empty() {
            StatusCode::OK
        } else if failed > 0 {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::UNPROCESSABLE_ENTITY
        };

        let body = Self {
            accepted,
            rejected,
            failed,
            outcomes,
        };
        (status, Json(body))
    }
}

/// `POST /api/readings`: one record object or an array of them.
async fn submit(
    State(monitor): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<SubmitResponse>) {
    // ---
    let records = match body {
        Value::Array(records) => records,
        single => vec![single],
    };
    info!("POST /api/readings - {} record(s)", records.len());

    let outcomes = monitor.submit(records, Utc::now()).await;
    SubmitResponse::from_outcomes(outcomes)
}

/// `POST /api/readings/frame`: one multi-metric controller frame.
async fn submit_frame(
    State(monitor): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<SubmitResponse>) {
    // ---
    info!("POST /api/readings/frame");
    let outcomes = monitor.submit_frame(body, Utc::now()).await;
    SubmitResponse::from_outcomes(outcomes)
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    device_id: Option<String>,
    metric: Option<Metric>,
}

async fn latest(
    State(monitor): State<AppState>,
    Query(params): Query<LatestQuery>,
) -> Json<Vec<Reading>> {
    // ---
    Json(monitor.latest(params.device_id.as_deref(), params.metric))
}
