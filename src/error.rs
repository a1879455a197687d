//! Error kinds for the ingestion-to-alert pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::Metric;

/// Why a single telemetry record was refused at ingestion.
///
/// Rejections are reported per record and never retried.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("malformed record: {detail}")]
    Malformed { detail: String },

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("unknown metric '{metric}'")]
    UnknownMetric { metric: String },

    #[error("value is not a finite number")]
    NonFinite,

    #[error("{metric} value {value} outside physical range [{min}, {max}]")]
    OutOfRange {
        metric: Metric,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("observed_at {observed_at} is beyond the allowed clock skew (limit {limit})")]
    FromFuture {
        observed_at: DateTime<Utc>,
        limit: DateTime<Utc>,
    },

    #[error("observed_at {observed_at} is older than the retention floor {floor}")]
    Stale {
        observed_at: DateTime<Utc>,
        floor: DateTime<Utc>,
    },

    #[error("device '{device_id}' is not registered")]
    UnregisteredDevice { device_id: String },
}

/// Failures of pipeline operations. Per-record rejections are never raised
/// as errors; they travel as `RejectionReason` inside the record outcome.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Persistence temporarily unavailable; callers retry with backoff.
    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("threshold config conflict for {metric}: expected version {expected}, current is {current}")]
    ConfigConflict {
        metric: Metric,
        expected: u64,
        current: u64,
    },

    #[error("invalid thresholds: {0}")]
    InvalidThresholds(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl MonitorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MonitorError::TransientStore(_))
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
