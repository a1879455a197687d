//! Read-only analytics: correlation matrix, daily summaries and the
//! context snapshot.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::Deserialize;

use super::AppState;
use crate::correlation::CorrelationMatrix;
use crate::error::MonitorError;
use crate::monitor::ContextSnapshot;
use crate::summary::DailySummary;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/correlations", get(correlations))
        .route("/api/summaries", get(summaries))
        .route("/api/context", get(context))
}

#[derive(Debug, Deserialize)]
struct CorrelationQuery {
    /// Trailing window length (default: 60).
    window_minutes: Option<i64>,
    device_id: Option<String>,
}

async fn correlations(
    State(monitor): State<AppState>,
    Query(params): Query<CorrelationQuery>,
) -> Result<Json<CorrelationMatrix>, MonitorError> {
    // ---
    let minutes = params.window_minutes.unwrap_or(60);
    let window = Duration::try_minutes(minutes)
        .ok_or_else(|| MonitorError::InvalidQuery(format!("window_minutes {minutes} out of range")))?;
    let matrix = monitor.correlations(window, params.device_id.as_deref(), Utc::now())?;
    Ok(Json(matrix))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    /// First day, inclusive (default: six days before `to`).
    from: Option<NaiveDate>,
    /// Last day, inclusive (default: today, UTC).
    to: Option<NaiveDate>,
}

/// `GET /api/summaries?from=YYYY-MM-DD&to=YYYY-MM-DD`
async fn summaries(
    State(monitor): State<AppState>,
    Query(params): Query<SummaryQuery>,
) -> Result<Json<Vec<DailySummary>>, MonitorError> {
    // ---
    let to = params.to.unwrap_or_else(|| Utc::now().date_naive());
    let from = match params.from {
        Some(from) => from,
        None => to
            .checked_sub_signed(Duration::days(6))
            .ok_or_else(|| MonitorError::InvalidQuery(format!("no week before {to}")))?,
    };
    Ok(Json(monitor.daily_summaries(from, to)?))
}

async fn context(State(monitor): State<AppState>) -> Json<ContextSnapshot> {
    Json(monitor.context_snapshot(Utc::now()))
}
