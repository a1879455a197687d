//! Aggregation Engine.
//!
//! Consumes validated readings and maintains, per series, O(1)-memory rolling
//! statistics plus fleet-wide bucket aggregates at minute/hour/day
//! granularity. Trend queries are answered from the buckets alone.
//!
//! Concurrency: every series and every bucket sits behind its own mutex,
//! held in sharded `DashMap`s so readings for unrelated series never contend
//! beyond a shard lookup. Slots are cloned out of the map before locking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AggregationConfig;
use crate::models::{Granularity, Metric, Reading, SeriesId};

// ---

/// Online mean/variance accumulator (Welford), mergeable with Chan's
/// parallel formula.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Welford {
    pub fn push(&mut self, value: f64) {
        // ---
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn merge(&self, other: &Welford) -> Welford {
        // ---
        if self.count == 0 {
            return *other;
        }
        if other.count == 0 {
            return *self;
        }

        let count = self.count + other.count;
        let n = count as f64;
        let delta = other.mean - self.mean;
        Welford {
            count,
            mean: self.mean + delta * other.count as f64 / n,
            m2: self.m2 + other.m2 + delta * delta * (self.count as f64 * other.count as f64) / n,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero until two samples exist.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).max(0.0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // ---
        let has_samples = self.count > 0;
        StatsSnapshot {
            count: self.count,
            mean: self.mean,
            variance: self.variance(),
            stddev: self.variance().sqrt(),
            min: has_samples.then_some(self.min),
            max: has_samples.then_some(self.max),
        }
    }
}

/// Read-only view of a series' rolling statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub count: u64,
    pub mean: f64,
    pub variance: f64,
    pub stddev: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Sliding-window statistics kept as two Welford epochs.
///
/// The window covers the current epoch plus the previous one, so it spans
/// between one and two epoch lengths while memory stays constant. Readings
/// that arrive late (before the current epoch start) fold into the current
/// epoch rather than being dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingStats {
    epoch_start: Option<DateTime<Utc>>,
    current: Welford,
    previous: Welford,
}

impl RollingStats {
    pub fn push(&mut self, value: f64, observed_at: DateTime<Utc>, epoch: Duration) {
        self.rotate(observed_at, epoch);
        self.current.push(value);
    }

    fn rotate(&mut self, at: DateTime<Utc>, epoch: Duration) {
        // ---
        let Some(start) = self.epoch_start else {
            self.epoch_start = Some(at);
            return;
        };

        if at < start + epoch {
            return;
        }

        if at < start + epoch * 2 {
            self.previous = std::mem::take(&mut self.current);
            self.epoch_start = Some(start + epoch);
        } else {
            // Silent for more than a full window: nothing left to remember.
            self.previous = Welford::default();
            self.current = Welford::default();
            self.epoch_start = Some(at);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.previous.merge(&self.current).snapshot()
    }
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub metric: Metric,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
}

/// Pre-computed summary of every reading inside one fixed time interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketAggregate {
    pub metric: Metric,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Window plus grace period has elapsed.
    pub finalized: bool,
    /// Readings folded in after finalization.
    pub late_revisions: u32,
}

impl BucketAggregate {
    fn empty(key: BucketKey) -> Self {
        Self {
            metric: key.metric,
            granularity: key.granularity,
            bucket_start: key.bucket_start,
            count: 0,
            sum: 0.0,
            mean: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            finalized: false,
            late_revisions: 0,
        }
    }

    fn fold(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.mean = self.sum / self.count as f64;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn key(&self) -> BucketKey {
        BucketKey {
            metric: self.metric,
            granularity: self.granularity,
            bucket_start: self.bucket_start,
        }
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + self.granularity.span()
    }

    /// Fold a snapshot of the same bucket taken at any point into this one.
    /// The figures with more readings win; finalization and late revisions
    /// never go backwards.
    pub fn absorb(&mut self, snapshot: &BucketAggregate) {
        // ---
        if snapshot.count >= self.count {
            self.count = snapshot.count;
            self.sum = snapshot.sum;
            self.mean = snapshot.mean;
            self.min = snapshot.min;
            self.max = snapshot.max;
        }
        self.finalized |= snapshot.finalized;
        self.late_revisions = self.late_revisions.max(snapshot.late_revisions);
    }
}

/// Persisted form of one series' rolling statistics.
///
/// `revision` counts the readings folded into the series; a store keeps the
/// record with the highest revision so a slow writer never rolls it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesStatsRecord {
    pub series: SeriesId,
    pub stats: RollingStats,
    #[serde(default)]
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// What one `ingest` call changed.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// Device series statistics before this reading was folded in; the
    /// baseline an anomaly is scored against.
    pub prior: StatsSnapshot,
    /// The reading landed in an already finalized minute bucket.
    pub late_revision: bool,
    pub buckets: Vec<BucketAggregate>,
    pub stats: Vec<SeriesStatsRecord>,
}

#[derive(Debug, Default)]
struct SeriesState {
    stats: RollingStats,
    revision: u64,
    latest: Option<Reading>,
    /// Minute start -> (sum, count), bounded by the correlation horizon.
    minutes: BTreeMap<DateTime<Utc>, (f64, u32)>,
}

pub struct AggregationEngine {
    cfg: AggregationConfig,
    series: DashMap<SeriesId, Arc<Mutex<SeriesState>>>,
    buckets: DashMap<BucketKey, Arc<Mutex<BucketAggregate>>>,
    /// Ordered view of `buckets` keys for range queries.
    index: RwLock<BTreeSet<BucketKey>>,
    /// Unfinalized buckets ordered by the instant they finalize.
    deadlines: Mutex<BTreeSet<(DateTime<Utc>, BucketKey)>>,
}

impl AggregationEngine {
    pub fn new(cfg: AggregationConfig) -> Self {
        Self {
            cfg,
            series: DashMap::new(),
            buckets: DashMap::new(),
            index: RwLock::new(BTreeSet::new()),
            deadlines: Mutex::new(BTreeSet::new()),
        }
    }

    /// Fold one validated reading into its device series, the fleet series
    /// and the minute/hour/day buckets that contain it.
    pub fn ingest(&self, reading: &Reading, now: DateTime<Utc>) -> IngestOutcome {
        // ---
        let mut prior = StatsSnapshot::default();
        let mut stats = Vec::with_capacity(2);

        for series_id in [reading.series(), SeriesId::fleet(reading.metric)] {
            let slot = self.series_slot(&series_id);
            let mut state = slot.lock();

            if series_id.device_id.is_some() {
                prior = state.stats.snapshot();
            }
            state
                .stats
                .push(reading.value, reading.observed_at, self.cfg.rolling_window);
            state.revision += 1;

            let newer = state
                .latest
                .as_ref()
                .map_or(true, |latest| reading.observed_at >= latest.observed_at);
            if newer {
                state.latest = Some(reading.clone());
            }

            self.record_minute(&mut state, reading);

            stats.push(SeriesStatsRecord {
                series: series_id,
                stats: state.stats.clone(),
                revision: state.revision,
                updated_at: now,
            });
        }

        let mut late_revision = false;
        let mut buckets = Vec::with_capacity(Granularity::ALL.len());
        for granularity in Granularity::ALL {
            let key = BucketKey {
                metric: reading.metric,
                granularity,
                bucket_start: granularity.bucket_start(reading.observed_at),
            };
            let slot = self.bucket_slot(key);
            let mut bucket = slot.lock();

            if !bucket.finalized && now >= bucket.bucket_end() + self.cfg.grace_period {
                bucket.finalized = true;
                self.deadlines.lock().remove(&(self.deadline(&bucket), key));
            }
            if bucket.finalized {
                bucket.late_revisions += 1;
                if granularity == Granularity::Minute {
                    late_revision = true;
                }
                debug!(
                    metric = %reading.metric,
                    granularity = granularity.as_str(),
                    bucket_start = %key.bucket_start,
                    "Late reading folded into finalized bucket"
                );
            }
            bucket.fold(reading.value);
            buckets.push(bucket.clone());
        }

        IngestOutcome {
            prior,
            late_revision,
            buckets,
            stats,
        }
    }

    fn deadline(&self, bucket: &BucketAggregate) -> DateTime<Utc> {
        bucket.bucket_end() + self.cfg.grace_period
    }

    fn record_minute(&self, state: &mut SeriesState, reading: &Reading) {
        // ---
        let minute = Granularity::Minute.bucket_start(reading.observed_at);
        let entry = state.minutes.entry(minute).or_insert((0.0, 0));
        entry.0 += reading.value;
        entry.1 += 1;

        if let Some(newest) = state.minutes.keys().next_back().copied() {
            let cutoff = newest - self.cfg.correlation_horizon;
            state.minutes = state.minutes.split_off(&cutoff);
        }
    }

    fn series_slot(&self, id: &SeriesId) -> Arc<Mutex<SeriesState>> {
        // ---
        if let Some(slot) = self.series.get(id) {
            return slot.value().clone();
        }
        self.series.entry(id.clone()).or_default().value().clone()
    }

    fn bucket_slot(&self, key: BucketKey) -> Arc<Mutex<BucketAggregate>> {
        // ---
        if let Some(slot) = self.buckets.get(&key) {
            return slot.value().clone();
        }
        match self.buckets.entry(key) {
            Entry::Occupied(slot) => slot.get().clone(),
            Entry::Vacant(vacant) => {
                let bucket = BucketAggregate::empty(key);
                self.deadlines.lock().insert((self.deadline(&bucket), key));
                self.index.write().insert(key);
                vacant.insert(Arc::new(Mutex::new(bucket))).value().clone()
            }
        }
    }

    /// Mark every bucket whose window plus grace period has elapsed as
    /// finalized. Returns the buckets that changed.
    pub fn finalize_elapsed(&self, now: DateTime<Utc>) -> Vec<BucketAggregate> {
        // ---
        let due: Vec<BucketKey> = {
            let mut deadlines = self.deadlines.lock();
            let mut due = Vec::new();
            while let Some(first) = deadlines.first().copied() {
                if first.0 > now {
                    break;
                }
                deadlines.remove(&first);
                due.push(first.1);
            }
            due
        };

        due.into_iter()
            .filter_map(|key| self.buckets.get(&key).map(|slot| slot.value().clone()))
            .filter_map(|slot| {
                let mut bucket = slot.lock();
                if bucket.finalized {
                    return None;
                }
                bucket.finalized = true;
                Some(bucket.clone())
            })
            .collect()
    }

    /// Current state of one bucket, if it exists.
    pub fn bucket(&self, key: &BucketKey) -> Option<BucketAggregate> {
        let slot = self.buckets.get(key).map(|slot| slot.value().clone())?;
        let bucket = slot.lock().clone();
        Some(bucket)
    }

    /// Ordered bucket aggregates for `metric` whose start lies in `[from, to]`.
    /// Served from the precomputed buckets only.
    pub fn query_trend(
        &self,
        metric: Metric,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<BucketAggregate> {
        // ---
        let lo = BucketKey {
            metric,
            granularity,
            bucket_start: granularity.bucket_start(from),
        };
        let hi = BucketKey {
            metric,
            granularity,
            bucket_start: to,
        };
        if lo > hi {
            return Vec::new();
        }

        let keys: Vec<BucketKey> = self.index.read().range(lo..=hi).copied().collect();
        keys.iter().filter_map(|key| self.bucket(key)).collect()
    }

    pub fn stats(&self, id: &SeriesId) -> Option<StatsSnapshot> {
        let slot = self.series.get(id).map(|slot| slot.value().clone())?;
        let snapshot = slot.lock().stats.snapshot();
        Some(snapshot)
    }

    /// Current persisted form of one series, if it has seen readings.
    pub fn stats_record(&self, id: &SeriesId, now: DateTime<Utc>) -> Option<SeriesStatsRecord> {
        // ---
        let slot = self.series.get(id).map(|slot| slot.value().clone())?;
        let state = slot.lock();
        Some(SeriesStatsRecord {
            series: id.clone(),
            stats: state.stats.clone(),
            revision: state.revision,
            updated_at: now,
        })
    }

    /// Most recent reading per device series, optionally filtered.
    pub fn latest(&self, device_id: Option<&str>, metric: Option<Metric>) -> Vec<Reading> {
        // ---
        let slots: Vec<Arc<Mutex<SeriesState>>> = self
            .series
            .iter()
            .filter(|entry| {
                let id = entry.key();
                id.device_id.is_some()
                    && device_id.map_or(true, |d| id.device_id.as_deref() == Some(d))
                    && metric.map_or(true, |m| id.metric == m)
            })
            .map(|entry| entry.value().clone())
            .collect();

        let mut readings: Vec<Reading> = slots
            .iter()
            .filter_map(|slot| slot.lock().latest.clone())
            .collect();

        readings.sort_by(|a, b| {
            a.device_id
                .cmp(&b.device_id)
                .then_with(|| a.metric.cmp(&b.metric))
        });
        readings
    }

    /// Minute-mean history of every device series inside `[from, to]`.
    pub fn minute_series(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<(SeriesId, BTreeMap<DateTime<Utc>, f64>)> {
        // ---
        let slots: Vec<(SeriesId, Arc<Mutex<SeriesState>>)> = self
            .series
            .iter()
            .filter(|entry| entry.key().device_id.is_some())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut out: Vec<_> = slots
            .into_iter()
            .map(|(id, slot)| {
                let state = slot.lock();
                let means = state
                    .minutes
                    .range(from..=to)
                    .map(|(minute, (sum, count))| (*minute, sum / f64::from(*count)))
                    .collect();
                (id, means)
            })
            .collect();

        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Warm-start from persisted buckets, series statistics and the latest
    /// reading of every device series.
    pub fn restore(
        &self,
        buckets: Vec<BucketAggregate>,
        stats: Vec<SeriesStatsRecord>,
        latest: Vec<Reading>,
    ) {
        // ---
        let bucket_count = buckets.len();
        let stats_count = stats.len();
        let latest_count = latest.len();
        for bucket in buckets {
            let key = bucket.key();
            if !bucket.finalized {
                self.deadlines.lock().insert((self.deadline(&bucket), key));
            }
            self.buckets.insert(key, Arc::new(Mutex::new(bucket)));
            self.index.write().insert(key);
        }

        for record in stats {
            let state = SeriesState {
                stats: record.stats,
                revision: record.revision,
                ..SeriesState::default()
            };
            self.series.insert(record.series, Arc::new(Mutex::new(state)));
        }

        for reading in latest {
            let slot = self.series_slot(&reading.series());
            let mut state = slot.lock();
            let newer = state
                .latest
                .as_ref()
                .map_or(true, |current| reading.observed_at >= current.observed_at);
            if newer {
                state.latest = Some(reading);
            }
        }

        debug!(
            "Aggregation engine restored {} buckets, {} series and {} latest readings",
            bucket_count, stats_count, latest_count
        );
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn reading(device: &str, metric: Metric, value: f64, at: DateTime<Utc>) -> Reading {
        Reading {
            device_id: device.to_string(),
            metric,
            value,
            observed_at: at,
            received_at: at,
        }
    }

    fn batch_mean_variance(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var)
    }

    #[test]
    fn test_welford_matches_batch_under_permutation() {
        // ---
        let values = [
            1.0e6 + 4.0,
            1.0e6 + 7.0,
            1.0e6 + 13.0,
            1.0e6 + 16.0,
            1.0e6 + 10.5,
            1.0e6 + 2.25,
        ];
        let (mean, var) = batch_mean_variance(&values);

        let orders: [[usize; 6]; 3] = [[0, 1, 2, 3, 4, 5], [5, 4, 3, 2, 1, 0], [2, 5, 0, 4, 1, 3]];
        for order in orders {
            let mut acc = Welford::default();
            for i in order {
                acc.push(values[i]);
            }
            assert!((acc.mean() - mean).abs() < 1e-6, "mean drifted for {order:?}");
            assert!((acc.variance() - var).abs() < 1e-6, "variance drifted for {order:?}");
        }
    }

    #[test]
    fn test_welford_merge_equals_sequential() {
        // ---
        let mut left = Welford::default();
        let mut right = Welford::default();
        let mut all = Welford::default();
        for (i, v) in [3.0, 9.0, 27.0, 1.5, 8.25, 4.0, 10.0].iter().enumerate() {
            if i % 2 == 0 {
                left.push(*v);
            } else {
                right.push(*v);
            }
            all.push(*v);
        }

        let merged = left.merge(&right).snapshot();
        let seq = all.snapshot();
        assert_eq!(merged.count, seq.count);
        assert!((merged.mean - seq.mean).abs() < 1e-12);
        assert!((merged.variance - seq.variance).abs() < 1e-9);
        assert_eq!(merged.min, Some(1.5));
        assert_eq!(merged.max, Some(27.0));
    }

    #[test]
    fn test_rolling_stats_forget_after_two_epochs() {
        // ---
        let epoch = Duration::hours(1);
        let mut stats = RollingStats::default();

        stats.push(10.0, t0(), epoch);
        stats.push(20.0, t0() + Duration::minutes(30), epoch);
        assert_eq!(stats.snapshot().count, 2);

        // Next epoch: previous is still inside the window.
        stats.push(30.0, t0() + Duration::minutes(70), epoch);
        assert_eq!(stats.snapshot().count, 3);

        // Third epoch: first epoch rotates out.
        stats.push(40.0, t0() + Duration::minutes(130), epoch);
        let snap = stats.snapshot();
        assert_eq!(snap.count, 2);
        assert!((snap.mean - 35.0).abs() < 1e-12);

        // Long silence resets everything.
        stats.push(50.0, t0() + Duration::hours(10), epoch);
        assert_eq!(stats.snapshot().count, 1);
    }

    #[test]
    fn test_ingest_reports_prior_stats() {
        // ---
        let engine = AggregationEngine::new(AggregationConfig::default());

        let first = engine.ingest(&reading("s1", Metric::Temperature, 20.0, t0()), t0());
        assert_eq!(first.prior.count, 0);

        let second = engine.ingest(
            &reading("s1", Metric::Temperature, 22.0, t0() + Duration::seconds(30)),
            t0(),
        );
        assert_eq!(second.prior.count, 1);
        assert_eq!(second.prior.mean, 20.0);

        let fleet = engine.stats(&SeriesId::fleet(Metric::Temperature)).unwrap();
        assert_eq!(fleet.count, 2);
        assert_eq!(fleet.mean, 21.0);
    }

    #[test]
    fn test_buckets_upsert_and_query_in_order() {
        // ---
        let engine = AggregationEngine::new(AggregationConfig::default());
        let values = [(0, 20.0), (0, 22.0), (1, 30.0), (3, 10.0)];
        for (minute, value) in values {
            let at = t0() + Duration::minutes(minute) + Duration::seconds(5);
            engine.ingest(&reading("s1", Metric::Temperature, value, at), at);
        }

        let minutes = engine.query_trend(
            Metric::Temperature,
            Granularity::Minute,
            t0(),
            t0() + Duration::minutes(10),
        );
        let starts: Vec<_> = minutes.iter().map(|b| b.bucket_start).collect();
        assert_eq!(
            starts,
            vec![t0(), t0() + Duration::minutes(1), t0() + Duration::minutes(3)]
        );
        assert_eq!(minutes[0].count, 2);
        assert_eq!(minutes[0].mean, 21.0);
        assert_eq!(minutes[0].min, 20.0);
        assert_eq!(minutes[0].max, 22.0);

        let hours = engine.query_trend(
            Metric::Temperature,
            Granularity::Hour,
            t0(),
            t0() + Duration::hours(1),
        );
        assert_eq!(hours.len(), 1);
        assert_eq!(hours[0].count, 4);
        assert_eq!(hours[0].sum, 82.0);

        let other_metric = engine.query_trend(
            Metric::Humidity,
            Granularity::Minute,
            t0(),
            t0() + Duration::hours(1),
        );
        assert!(other_metric.is_empty());
    }

    #[test]
    fn test_late_reading_within_grace_is_not_a_revision() {
        // ---
        let engine = AggregationEngine::new(AggregationConfig::default());
        let at = t0() + Duration::seconds(10);
        let now = t0() + Duration::minutes(3);

        let outcome = engine.ingest(&reading("s1", Metric::Humidity, 60.0, at), now);
        assert!(!outcome.late_revision);
        assert!(outcome.buckets.iter().all(|b| !b.finalized));
    }

    #[test]
    fn test_reading_after_grace_is_flagged_late_revision() {
        // ---
        let engine = AggregationEngine::new(AggregationConfig::default());
        let at = t0() + Duration::seconds(10);
        engine.ingest(&reading("s1", Metric::Humidity, 60.0, at), at);

        let finalized = engine.finalize_elapsed(t0() + Duration::minutes(10));
        assert_eq!(finalized.len(), 1, "only the minute bucket is due");
        assert_eq!(finalized[0].granularity, Granularity::Minute);

        let late = engine.ingest(
            &reading("s2", Metric::Humidity, 64.0, at),
            t0() + Duration::minutes(10),
        );
        assert!(late.late_revision);

        let minute = &engine.query_trend(Metric::Humidity, Granularity::Minute, t0(), t0())[0];
        assert!(minute.finalized);
        assert_eq!(minute.count, 2);
        assert_eq!(minute.late_revisions, 1);
    }

    #[test]
    fn test_latest_reading_per_series() {
        // ---
        let engine = AggregationEngine::new(AggregationConfig::default());
        engine.ingest(&reading("s1", Metric::Methane, 100.0, t0()), t0());
        engine.ingest(
            &reading("s1", Metric::Methane, 140.0, t0() + Duration::minutes(1)),
            t0(),
        );
        // Out-of-order arrival does not replace the newer reading.
        engine.ingest(
            &reading("s1", Metric::Methane, 90.0, t0() - Duration::minutes(1)),
            t0(),
        );
        engine.ingest(&reading("s2", Metric::Humidity, 55.0, t0()), t0());

        let all = engine.latest(None, None);
        assert_eq!(all.len(), 2);

        let methane = engine.latest(Some("s1"), Some(Metric::Methane));
        assert_eq!(methane.len(), 1);
        assert_eq!(methane[0].value, 140.0);
    }

    #[test]
    fn test_minute_series_are_bounded_by_window() {
        // ---
        let engine = AggregationEngine::new(AggregationConfig::default());
        for minute in 0..5 {
            let at = t0() + Duration::minutes(minute);
            engine.ingest(&reading("s1", Metric::Temperature, 20.0 + minute as f64, at), at);
        }

        let series = engine.minute_series(t0() + Duration::minutes(2), t0() + Duration::minutes(4));
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].1.len(), 3);
    }

    #[test]
    fn test_stats_revision_counts_folded_readings() {
        // ---
        let engine = AggregationEngine::new(AggregationConfig::default());
        engine.ingest(&reading("a", Metric::Methane, 100.0, t0()), t0());
        let second = engine.ingest(&reading("b", Metric::Methane, 120.0, t0()), t0());

        let fleet = second.stats.iter().find(|r| r.series.device_id.is_none()).unwrap();
        assert_eq!(fleet.revision, 2);
        let device = second.stats.iter().find(|r| r.series.device_id.is_some()).unwrap();
        assert_eq!(device.revision, 1);

        let current = engine
            .stats_record(&SeriesId::fleet(Metric::Methane), t0())
            .unwrap();
        assert_eq!(current.revision, 2);
    }

    #[test]
    fn test_restore_seeds_latest_readings() {
        // ---
        let engine = AggregationEngine::new(AggregationConfig::default());
        let record = SeriesStatsRecord {
            series: SeriesId::device("s1", Metric::Methane),
            stats: RollingStats::default(),
            revision: 4,
            updated_at: t0(),
        };
        engine.restore(
            Vec::new(),
            vec![record],
            vec![
                reading("s1", Metric::Methane, 140.0, t0()),
                reading("s2", Metric::Humidity, 55.0, t0()),
            ],
        );

        assert_eq!(engine.latest(None, None).len(), 2);
        assert_eq!(engine.latest(Some("s1"), None)[0].value, 140.0);

        let next = engine.ingest(
            &reading("s1", Metric::Methane, 150.0, t0() + Duration::minutes(1)),
            t0(),
        );
        assert_eq!(next.stats[0].revision, 5, "revision continues from the stored record");
    }
}
