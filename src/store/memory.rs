//! In-process `Store` used by tests and by the binary when no
//! `DATABASE_URL` is configured.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::Store;
use crate::aggregation::{BucketAggregate, BucketKey, SeriesStatsRecord};
use crate::error::{MonitorError, Result};
use crate::models::{Alert, AlertTransition, Metric, Reading, SeriesId};
use crate::thresholds::ThresholdConfig;

#[derive(Default)]
struct Tables {
    reading_ids: HashSet<(String, Metric, DateTime<Utc>)>,
    readings: Vec<Reading>,
    buckets: BTreeMap<BucketKey, BucketAggregate>,
    series_stats: HashMap<SeriesId, SeriesStatsRecord>,
    alerts: HashMap<Uuid, Alert>,
    transitions: Vec<AlertTransition>,
    thresholds: Vec<ThresholdConfig>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        // ---
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(MonitorError::TransientStore(
                "injected write failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.tables.lock().readings.clone()
    }

    pub fn alert(&self, id: Uuid) -> Option<Alert> {
        self.tables.lock().alerts.get(&id).cloned()
    }

    pub fn transitions(&self) -> Vec<AlertTransition> {
        self.tables.lock().transitions.clone()
    }

    pub fn threshold_history(&self, metric: Metric) -> Vec<ThresholdConfig> {
        self.tables
            .lock()
            .thresholds
            .iter()
            .filter(|cfg| cfg.metric == metric)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<bool> {
        // ---
        self.check_write()?;
        let mut tables = self.tables.lock();
        let identity = (
            reading.device_id.clone(),
            reading.metric,
            reading.observed_at,
        );
        if !tables.reading_ids.insert(identity) {
            return Ok(false);
        }
        tables.readings.push(reading.clone());
        Ok(true)
    }

    async fn upsert_bucket(&self, bucket: &BucketAggregate) -> Result<()> {
        // ---
        self.check_write()?;
        self.tables
            .lock()
            .buckets
            .entry(bucket.key())
            .and_modify(|stored| stored.absorb(bucket))
            .or_insert_with(|| bucket.clone());
        Ok(())
    }

    async fn upsert_series_stats(&self, record: &SeriesStatsRecord) -> Result<()> {
        // ---
        self.check_write()?;
        let mut tables = self.tables.lock();
        let stale = tables
            .series_stats
            .get(&record.series)
            .is_some_and(|stored| stored.revision >= record.revision);
        if !stale {
            tables.series_stats.insert(record.series.clone(), record.clone());
        }
        Ok(())
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        self.check_write()?;
        self.tables.lock().alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn append_transition(&self, transition: &AlertTransition) -> Result<()> {
        self.check_write()?;
        self.tables.lock().transitions.push(transition.clone());
        Ok(())
    }

    async fn save_thresholds(&self, config: &ThresholdConfig) -> Result<()> {
        // ---
        self.check_write()?;
        let mut tables = self.tables.lock();
        let exists = tables
            .thresholds
            .iter()
            .any(|c| c.metric == config.metric && c.version == config.version);
        if exists {
            return Err(MonitorError::Store(format!(
                "threshold config {} v{} already stored",
                config.metric, config.version
            )));
        }
        tables.thresholds.push(config.clone());
        Ok(())
    }

    async fn load_thresholds(&self) -> Result<Vec<ThresholdConfig>> {
        // ---
        let tables = self.tables.lock();
        let mut latest: BTreeMap<Metric, ThresholdConfig> = BTreeMap::new();
        for cfg in &tables.thresholds {
            let newer = latest
                .get(&cfg.metric)
                .map_or(true, |current| cfg.version > current.version);
            if newer {
                latest.insert(cfg.metric, cfg.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn load_buckets(&self, since: DateTime<Utc>) -> Result<Vec<BucketAggregate>> {
        Ok(self
            .tables
            .lock()
            .buckets
            .values()
            .filter(|b| b.bucket_start >= since)
            .cloned()
            .collect())
    }

    async fn load_latest_readings(&self) -> Result<Vec<Reading>> {
        // ---
        let tables = self.tables.lock();
        let mut latest: HashMap<SeriesId, &Reading> = HashMap::new();
        for reading in &tables.readings {
            let newer = latest
                .get(&reading.series())
                .map_or(true, |current| reading.observed_at > current.observed_at);
            if newer {
                latest.insert(reading.series(), reading);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn load_series_stats(&self) -> Result<Vec<SeriesStatsRecord>> {
        Ok(self.tables.lock().series_stats.values().cloned().collect())
    }

    async fn load_alerts(&self) -> Result<Vec<Alert>> {
        Ok(self
            .tables
            .lock()
            .alerts
            .values()
            .filter(|a| a.archived_at.is_none())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    fn reading(value: f64) -> Reading {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        Reading {
            device_id: "s1".to_string(),
            metric: Metric::Methane,
            value,
            observed_at: at,
            received_at: at,
        }
    }

    #[tokio::test]
    async fn test_reading_identity_is_unique() {
        // ---
        let store = MemoryStore::new();
        assert!(assert_ok!(store.insert_reading(&reading(120.0)).await));
        // Same identity, even with a different value, is a duplicate.
        assert!(!assert_ok!(store.insert_reading(&reading(121.0)).await));
        assert_eq!(store.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient_and_bounded() {
        // ---
        let store = MemoryStore::new();
        store.fail_next_writes(2);

        let first = assert_err!(store.insert_reading(&reading(1.0)).await);
        assert!(first.is_transient());
        assert_err!(store.insert_reading(&reading(1.0)).await);
        assert_ok!(store.insert_reading(&reading(1.0)).await);
    }

    #[tokio::test]
    async fn test_threshold_versions_are_kept() {
        // ---
        let store = MemoryStore::new();
        let now = Utc::now();
        let v1 = ThresholdConfig::defaults(Metric::Methane, 0.05, now);
        let v2 = ThresholdConfig {
            version: 2,
            ..v1.clone()
        };

        assert_ok!(store.save_thresholds(&v1).await);
        assert_ok!(store.save_thresholds(&v2).await);
        assert_err!(store.save_thresholds(&v2).await);

        let latest = assert_ok!(store.load_thresholds().await);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, 2);
        assert_eq!(store.threshold_history(Metric::Methane).len(), 2);
    }

    fn bucket(count: u64, mean: f64, finalized: bool) -> BucketAggregate {
        BucketAggregate {
            metric: Metric::Methane,
            granularity: crate::models::Granularity::Hour,
            bucket_start: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            count,
            sum: mean * count as f64,
            mean,
            min: mean,
            max: mean,
            finalized,
            late_revisions: 0,
        }
    }

    #[tokio::test]
    async fn test_slow_bucket_write_never_rolls_back() {
        // ---
        let store = MemoryStore::new();
        assert_ok!(store.upsert_bucket(&bucket(2, 110.0, false)).await);
        assert_ok!(store.upsert_bucket(&bucket(1, 100.0, false)).await);

        let stored = assert_ok!(store.load_buckets(DateTime::<Utc>::MIN_UTC).await);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].count, 2);
        assert_eq!(stored[0].mean, 110.0);

        // Finalization sticks even when an older snapshot lands afterwards.
        assert_ok!(store.upsert_bucket(&bucket(2, 110.0, true)).await);
        assert_ok!(store.upsert_bucket(&bucket(2, 110.0, false)).await);
        let stored = assert_ok!(store.load_buckets(DateTime::<Utc>::MIN_UTC).await);
        assert!(stored[0].finalized);
    }

    #[tokio::test]
    async fn test_older_stats_revision_is_ignored() {
        // ---
        let store = MemoryStore::new();
        let record = |revision: u64| SeriesStatsRecord {
            series: SeriesId::fleet(Metric::Methane),
            stats: Default::default(),
            revision,
            updated_at: Utc::now(),
        };

        assert_ok!(store.upsert_series_stats(&record(5)).await);
        assert_ok!(store.upsert_series_stats(&record(3)).await);
        let stored = assert_ok!(store.load_series_stats().await);
        assert_eq!(stored[0].revision, 5);
    }

    #[tokio::test]
    async fn test_latest_reading_per_series() {
        // ---
        let store = MemoryStore::new();
        let first = reading(120.0);
        let later = Reading {
            value: 140.0,
            observed_at: first.observed_at + chrono::Duration::minutes(1),
            ..first.clone()
        };
        assert_ok!(store.insert_reading(&later).await);
        assert_ok!(store.insert_reading(&first).await);

        let latest = assert_ok!(store.load_latest_readings().await);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value, 140.0);
    }
}
