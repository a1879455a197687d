//! PostgreSQL `Store` backed by a sqlx connection pool.
//!
//! Enumerations are stored as their snake_case text form; rolling statistics
//! and threshold bands are stored as JSONB. Bucket and statistics upserts
//! are conditional so a slow writer cannot overwrite a newer row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::Store;
use crate::aggregation::{BucketAggregate, RollingStats, SeriesStatsRecord};
use crate::error::{MonitorError, Result};
use crate::models::{Alert, AlertTransition, Reading, SeriesId};
use crate::thresholds::{Band, ThresholdConfig};

// ---

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Connection-level failures are worth retrying; everything else is not.
fn map_sqlx(e: sqlx::Error) -> MonitorError {
    // ---
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => MonitorError::TransientStore(e.to_string()),
        _ => MonitorError::Store(e.to_string()),
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse().map_err(MonitorError::Store)
}

#[derive(FromRow)]
struct BucketRow {
    metric: String,
    granularity: String,
    bucket_start: DateTime<Utc>,
    count: i64,
    sum: f64,
    mean: f64,
    min: f64,
    max: f64,
    finalized: bool,
    late_revisions: i32,
}

impl TryFrom<BucketRow> for BucketAggregate {
    type Error = MonitorError;

    fn try_from(row: BucketRow) -> Result<Self> {
        Ok(BucketAggregate {
            metric: parse_column(&row.metric)?,
            granularity: parse_column(&row.granularity)?,
            bucket_start: row.bucket_start,
            count: row.count.max(0) as u64,
            sum: row.sum,
            mean: row.mean,
            min: row.min,
            max: row.max,
            finalized: row.finalized,
            late_revisions: row.late_revisions.max(0) as u32,
        })
    }
}

#[derive(FromRow)]
struct SeriesStatsRow {
    device_id: String,
    metric: String,
    stats: Json<RollingStats>,
    revision: i64,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ReadingRow {
    device_id: String,
    metric: String,
    value: f64,
    observed_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = MonitorError;

    fn try_from(row: ReadingRow) -> Result<Self> {
        Ok(Reading {
            device_id: row.device_id,
            metric: parse_column(&row.metric)?,
            value: row.value,
            observed_at: row.observed_at,
            received_at: row.received_at,
        })
    }
}

#[derive(FromRow)]
struct AlertRow {
    id: Uuid,
    device_id: String,
    metric: String,
    origins: Vec<String>,
    severity: String,
    state: String,
    triggered_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    state_changed_at: DateTime<Utc>,
    acknowledged_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    last_notified_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
    trigger_count: i32,
    message: String,
}

impl TryFrom<AlertRow> for Alert {
    type Error = MonitorError;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            id: row.id,
            device_id: row.device_id,
            metric: parse_column(&row.metric)?,
            origins: row
                .origins
                .iter()
                .map(|origin| parse_column(origin))
                .collect::<Result<_>>()?,
            severity: parse_column(&row.severity)?,
            state: parse_column(&row.state)?,
            triggered_at: row.triggered_at,
            last_seen_at: row.last_seen_at,
            state_changed_at: row.state_changed_at,
            acknowledged_at: row.acknowledged_at,
            closed_at: row.closed_at,
            last_notified_at: row.last_notified_at,
            archived_at: row.archived_at,
            trigger_count: row.trigger_count.max(0) as u32,
            message: row.message,
        })
    }
}

#[derive(FromRow)]
struct ThresholdRow {
    metric: String,
    version: i64,
    bands: Json<Vec<Band>>,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl Store for PgStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<bool> {
        // ---
        let result = sqlx::query(
            r#"
            INSERT INTO readings (device_id, metric, value, observed_at, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id, metric, observed_at) DO NOTHING
            "#,
        )
        .bind(&reading.device_id)
        .bind(reading.metric.as_str())
        .bind(reading.value)
        .bind(reading.observed_at)
        .bind(reading.received_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_bucket(&self, bucket: &BucketAggregate) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO buckets (
                metric, granularity, bucket_start,
                count, sum, mean, min, max, finalized, late_revisions
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (metric, granularity, bucket_start) DO UPDATE SET
                count = GREATEST(buckets.count, EXCLUDED.count),
                sum   = CASE WHEN EXCLUDED.count >= buckets.count
                             THEN EXCLUDED.sum ELSE buckets.sum END,
                mean  = CASE WHEN EXCLUDED.count >= buckets.count
                             THEN EXCLUDED.mean ELSE buckets.mean END,
                min   = CASE WHEN EXCLUDED.count >= buckets.count
                             THEN EXCLUDED.min ELSE buckets.min END,
                max   = CASE WHEN EXCLUDED.count >= buckets.count
                             THEN EXCLUDED.max ELSE buckets.max END,
                finalized      = buckets.finalized OR EXCLUDED.finalized,
                late_revisions = GREATEST(buckets.late_revisions, EXCLUDED.late_revisions)
            "#,
        )
        .bind(bucket.metric.as_str())
        .bind(bucket.granularity.as_str())
        .bind(bucket.bucket_start)
        .bind(bucket.count as i64)
        .bind(bucket.sum)
        .bind(bucket.mean)
        .bind(bucket.min)
        .bind(bucket.max)
        .bind(bucket.finalized)
        .bind(bucket.late_revisions as i32)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn upsert_series_stats(&self, record: &SeriesStatsRecord) -> Result<()> {
        // ---
        // Fleet series are stored under the empty device id.
        let device_id = record.series.device_id.clone().unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO series_stats (device_id, metric, stats, revision, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id, metric) DO UPDATE SET
                stats      = EXCLUDED.stats,
                revision   = EXCLUDED.revision,
                updated_at = EXCLUDED.updated_at
            WHERE series_stats.revision < EXCLUDED.revision
            "#,
        )
        .bind(device_id)
        .bind(record.series.metric.as_str())
        .bind(Json(&record.stats))
        .bind(record.revision as i64)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, device_id, metric, origins, severity, state,
                triggered_at, last_seen_at, state_changed_at, acknowledged_at,
                closed_at, last_notified_at, archived_at, trigger_count, message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                origins          = EXCLUDED.origins,
                severity         = EXCLUDED.severity,
                state            = EXCLUDED.state,
                last_seen_at     = EXCLUDED.last_seen_at,
                state_changed_at = EXCLUDED.state_changed_at,
                acknowledged_at  = EXCLUDED.acknowledged_at,
                closed_at        = EXCLUDED.closed_at,
                last_notified_at = EXCLUDED.last_notified_at,
                archived_at      = EXCLUDED.archived_at,
                trigger_count    = EXCLUDED.trigger_count,
                message          = EXCLUDED.message
            "#,
        )
        .bind(alert.id)
        .bind(&alert.device_id)
        .bind(alert.metric.as_str())
        .bind(
            alert
                .origins
                .iter()
                .map(|origin| origin.as_str().to_string())
                .collect::<Vec<_>>(),
        )
        .bind(alert.severity.as_str())
        .bind(alert.state.as_str())
        .bind(alert.triggered_at)
        .bind(alert.last_seen_at)
        .bind(alert.state_changed_at)
        .bind(alert.acknowledged_at)
        .bind(alert.closed_at)
        .bind(alert.last_notified_at)
        .bind(alert.archived_at)
        .bind(alert.trigger_count as i32)
        .bind(&alert.message)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn append_transition(&self, transition: &AlertTransition) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO alert_transitions (
                alert_id, from_state, to_state, severity, trigger_count, at, note
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(transition.alert_id)
        .bind(transition.from.map(|s| s.as_str()))
        .bind(transition.to.as_str())
        .bind(transition.severity.as_str())
        .bind(transition.trigger_count as i32)
        .bind(transition.at)
        .bind(&transition.note)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn save_thresholds(&self, config: &ThresholdConfig) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO threshold_configs (metric, version, bands, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(config.metric.as_str())
        .bind(config.version as i64)
        .bind(Json(&config.bands))
        .bind(config.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_thresholds(&self) -> Result<Vec<ThresholdConfig>> {
        // ---
        let rows: Vec<ThresholdRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (metric) metric, version, bands, updated_at
            FROM threshold_configs
            ORDER BY metric, version DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.into_iter()
            .map(|row| {
                Ok(ThresholdConfig {
                    metric: parse_column(&row.metric)?,
                    version: row.version.max(0) as u64,
                    bands: row.bands.0,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }

    async fn load_buckets(&self, since: DateTime<Utc>) -> Result<Vec<BucketAggregate>> {
        // ---
        let rows: Vec<BucketRow> = sqlx::query_as(
            r#"
            SELECT metric, granularity, bucket_start, count, sum, mean, min, max,
                   finalized, late_revisions
            FROM buckets
            WHERE bucket_start >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        debug!("Loaded {} buckets since {}", rows.len(), since);
        rows.into_iter().map(BucketAggregate::try_from).collect()
    }

    async fn load_latest_readings(&self) -> Result<Vec<Reading>> {
        // ---
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (device_id, metric)
                   device_id, metric, value, observed_at, received_at
            FROM readings
            ORDER BY device_id, metric, observed_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        debug!("Loaded latest readings for {} series", rows.len());
        rows.into_iter().map(Reading::try_from).collect()
    }

    async fn load_series_stats(&self) -> Result<Vec<SeriesStatsRecord>> {
        // ---
        let rows: Vec<SeriesStatsRow> = sqlx::query_as(
            "SELECT device_id, metric, stats, revision, updated_at FROM series_stats",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.into_iter()
            .map(|row| {
                let metric = parse_column(&row.metric)?;
                let series = if row.device_id.is_empty() {
                    SeriesId::fleet(metric)
                } else {
                    SeriesId::device(&row.device_id, metric)
                };
                Ok(SeriesStatsRecord {
                    series,
                    stats: row.stats.0,
                    revision: row.revision.max(0) as u64,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }

    async fn load_alerts(&self) -> Result<Vec<Alert>> {
        // ---
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, metric, origins, severity, state,
                   triggered_at, last_seen_at, state_changed_at, acknowledged_at,
                   closed_at, last_notified_at, archived_at, trigger_count, message
            FROM alerts
            WHERE archived_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.into_iter().map(Alert::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::AlertOrigin;

    #[test]
    fn test_connection_errors_are_transient() {
        // ---
        assert!(map_sqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx(sqlx::Error::PoolClosed).is_transient());
        assert!(!map_sqlx(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_alert_row_rejects_unknown_state() {
        // ---
        let now = Utc::now();
        let row = AlertRow {
            id: Uuid::new_v4(),
            device_id: "s1".to_string(),
            metric: "methane".to_string(),
            origins: vec!["threshold".to_string()],
            severity: "critical".to_string(),
            state: "snoozed".to_string(),
            triggered_at: now,
            last_seen_at: now,
            state_changed_at: now,
            acknowledged_at: None,
            closed_at: None,
            last_notified_at: None,
            archived_at: None,
            trigger_count: 1,
            message: "CRITICAL: Methane too high (350 ppm)".to_string(),
        };
        assert!(matches!(Alert::try_from(row), Err(MonitorError::Store(_))));
    }

    #[test]
    fn test_alert_row_collects_origins() {
        // ---
        let now = Utc::now();
        let row = AlertRow {
            id: Uuid::new_v4(),
            device_id: "s1".to_string(),
            metric: "humidity".to_string(),
            origins: vec!["anomaly".to_string(), "threshold".to_string()],
            severity: "warning".to_string(),
            state: "open".to_string(),
            triggered_at: now,
            last_seen_at: now,
            state_changed_at: now,
            acknowledged_at: None,
            closed_at: None,
            last_notified_at: None,
            archived_at: None,
            trigger_count: 2,
            message: "WARNING: Humidity high (77%)".to_string(),
        };
        let alert = Alert::try_from(row).unwrap();
        assert_eq!(alert.origins.len(), 2);
        assert!(alert.origins.contains(&AlertOrigin::Anomaly));
    }
}
