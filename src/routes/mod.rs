//! HTTP gateway for the `envwatch` service (EMBP).
//!
//! Each sibling module exports a subrouter over the shared `Arc<Monitor>`
//! state; this module merges them and owns the mapping from `MonitorError`
//! to HTTP status codes, so `main.rs` only ever calls `routes::router`.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, error};

use crate::error::MonitorError;
use crate::Monitor;

mod alerts;
mod analytics;
mod health;
mod readings;
mod thresholds;
mod trends;

pub type AppState = Arc<Monitor>;

// ---

pub fn router(monitor: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(trends::router())
        .merge(alerts::router())
        .merge(thresholds::router())
        .merge(analytics::router())
        .merge(health::router())
        .with_state(monitor)
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        // ---
        let status = match &self {
            MonitorError::InvalidThresholds(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MonitorError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            MonitorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitorError::ConfigConflict { .. } => StatusCode::CONFLICT,
            MonitorError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request refused: {}", self);
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Metric;

    #[test]
    fn test_error_status_mapping() {
        // ---
        let cases = [
            (MonitorError::NotFound("alert".into()), StatusCode::NOT_FOUND),
            (
                MonitorError::ConfigConflict {
                    metric: Metric::Methane,
                    expected: 1,
                    current: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                MonitorError::TransientStore("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                MonitorError::InvalidThresholds("gap".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (MonitorError::InvalidQuery("range".into()), StatusCode::BAD_REQUEST),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
