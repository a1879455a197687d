//! Test `Store` that holds back writes carrying the first revision of a
//! row, so that a later write for the same row lands before it.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{MemoryStore, Store};
use crate::aggregation::{BucketAggregate, SeriesStatsRecord};
use crate::error::Result;
use crate::models::{Alert, AlertTransition, Reading};
use crate::thresholds::ThresholdConfig;

pub(crate) struct LaggingStore {
    pub(crate) inner: Arc<MemoryStore>,
    lag: StdDuration,
}

impl LaggingStore {
    pub(crate) fn new(lag: StdDuration) -> Self {
        Self {
            inner: Arc::new(MemoryStore::new()),
            lag,
        }
    }

    async fn hold_if(&self, first: bool) {
        if first {
            tokio::time::sleep(self.lag).await;
        }
    }
}

#[async_trait]
impl Store for LaggingStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<bool> {
        self.inner.insert_reading(reading).await
    }

    async fn upsert_bucket(&self, bucket: &BucketAggregate) -> Result<()> {
        self.hold_if(bucket.count == 1).await;
        self.inner.upsert_bucket(bucket).await
    }

    async fn upsert_series_stats(&self, record: &SeriesStatsRecord) -> Result<()> {
        self.hold_if(record.revision == 1).await;
        self.inner.upsert_series_stats(record).await
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        self.hold_if(alert.trigger_count == 1).await;
        self.inner.upsert_alert(alert).await
    }

    async fn append_transition(&self, transition: &AlertTransition) -> Result<()> {
        self.inner.append_transition(transition).await
    }

    async fn save_thresholds(&self, config: &ThresholdConfig) -> Result<()> {
        self.inner.save_thresholds(config).await
    }

    async fn load_thresholds(&self) -> Result<Vec<ThresholdConfig>> {
        self.inner.load_thresholds().await
    }

    async fn load_buckets(&self, since: DateTime<Utc>) -> Result<Vec<BucketAggregate>> {
        self.inner.load_buckets(since).await
    }

    async fn load_latest_readings(&self) -> Result<Vec<Reading>> {
        self.inner.load_latest_readings().await
    }

    async fn load_series_stats(&self) -> Result<Vec<SeriesStatsRecord>> {
        self.inner.load_series_stats().await
    }

    async fn load_alerts(&self) -> Result<Vec<Alert>> {
        self.inner.load_alerts().await
    }
}
