use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use crate::aggregation::BucketAggregate;
use crate::error::MonitorError;
use crate::models::{Granularity, Metric};

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/api/trends", get(trend))
}

#[derive(Debug, Deserialize)]
struct TrendQuery {
    metric: Metric,
    granularity: Option<Granularity>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// `GET /api/trends?metric=..&granularity=..&from=..&to=..`
///
/// Defaults to hourly buckets over the last 24 hours.
async fn trend(
    State(monitor): State<AppState>,
    Query(params): Query<TrendQuery>,
) -> Result<Json<Vec<BucketAggregate>>, MonitorError> {
    // ---
    debug!("GET /api/trends {:?}", params);
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - Duration::hours(24));
    let granularity = params.granularity.unwrap_or(Granularity::Hour);

    let buckets = monitor.trend(params.metric, granularity, from, to)?;
    Ok(Json(buckets))
}
