//! Persistence gateway.
//!
//! The pipeline talks to storage only through the `Store` trait. Two
//! implementations are provided: `MemoryStore` (tests, local runs without a
//! database) and `PgStore` (PostgreSQL via sqlx). Transient failures are
//! reported as `MonitorError::TransientStore` so callers can retry them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::aggregation::{BucketAggregate, SeriesStatsRecord};
use crate::error::Result;
use crate::models::{Alert, AlertTransition, Reading};
use crate::thresholds::ThresholdConfig;

#[cfg(test)]
mod lagging;
mod memory;
mod postgres;

#[cfg(test)]
pub(crate) use lagging::LaggingStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

#[async_trait]
pub trait Store: Send + Sync {
    /// Append a reading. Returns `false` when a reading with the same
    /// (device_id, metric, observed_at) already exists.
    async fn insert_reading(&self, reading: &Reading) -> Result<bool>;

    /// Writes may land out of order; the stored bucket keeps the snapshot
    /// with the most readings (see `BucketAggregate::absorb`).
    async fn upsert_bucket(&self, bucket: &BucketAggregate) -> Result<()>;

    /// Ignored unless `record.revision` is newer than the stored one.
    async fn upsert_series_stats(&self, record: &SeriesStatsRecord) -> Result<()>;

    async fn upsert_alert(&self, alert: &Alert) -> Result<()>;

    async fn append_transition(&self, transition: &AlertTransition) -> Result<()>;

    /// Store a new config version. Earlier versions are kept.
    async fn save_thresholds(&self, config: &ThresholdConfig) -> Result<()>;

    /// Latest version per metric.
    async fn load_thresholds(&self) -> Result<Vec<ThresholdConfig>>;

    /// Buckets starting at or after `since`.
    async fn load_buckets(&self, since: DateTime<Utc>) -> Result<Vec<BucketAggregate>>;

    /// Most recent reading of every (device, metric) series.
    async fn load_latest_readings(&self) -> Result<Vec<Reading>>;

    async fn load_series_stats(&self) -> Result<Vec<SeriesStatsRecord>>;

    /// Alerts that are not archived.
    async fn load_alerts(&self) -> Result<Vec<Alert>>;
}
