//! Pipeline orchestration.
//!
//! `Monitor` owns every stage and drives the flow
//! raw record -> Validator -> Aggregation Engine -> {Anomaly Detector,
//! Threshold Evaluator} -> Alert Lifecycle Manager -> events.
//!
//! Readings of one (device, metric) series are applied one at a time
//! through a per-series async gate, so persistence, aggregation and alert
//! evaluation for that series happen in order. Unrelated series proceed in
//! parallel. Within a batch, accepted readings are applied in `observed_at`
//! order; outcomes are reported in submission order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregation::{AggregationEngine, BucketAggregate, IngestOutcome, StatsSnapshot};
use crate::alerts::{AlertManager, AlertQuery, AlertSummary, SweepReport, Trigger};
use crate::anomaly::AnomalyDetector;
use crate::config::PipelineConfig;
use crate::correlation::{compute_correlations, CorrelationMatrix};
use crate::error::{MonitorError, RejectionReason, Result};
use crate::events::{CoreEvent, EventBus, HealthReport, HealthState};
use crate::locks::KeyedGates;
use crate::models::{
    Alert, AlertOrigin, Granularity, Metric, RawFrame, Reading, SeriesId,
};
use crate::retry::with_backoff;
use crate::store::Store;
use crate::summary::{summarize_days, DailySummary};
use crate::thresholds::{Band, Level, SeriesLevelView, ThresholdConfig, ThresholdEvaluator};
use crate::validator::Validator;

const EVENT_CAPACITY: usize = 1024;
const MAX_SUMMARY_DAYS: i64 = 366;

// ---

/// Per-record result of a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Accepted {
        index: usize,
        device_id: String,
        metric: Metric,
        observed_at: DateTime<Utc>,
        /// Identical reading was already accepted; nothing was applied again.
        duplicate: bool,
        late_revision: bool,
        /// Alerts opened or refreshed by this reading.
        alerts: Vec<Uuid>,
    },
    Rejected {
        index: usize,
        reason: RejectionReason,
        message: String,
    },
    /// Valid, but could not be stored; the caller may resubmit.
    Failed { index: usize, error: String },
}

impl RecordOutcome {
    pub fn index(&self) -> usize {
        match self {
            RecordOutcome::Accepted { index, .. }
            | RecordOutcome::Rejected { index, .. }
            | RecordOutcome::Failed { index, .. } => *index,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, RecordOutcome::Accepted { .. })
    }
}

/// Immutable view of the system for external consumers (dashboards, an
/// assistant). Built on demand; never updated in place.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub generated_at: DateTime<Utc>,
    pub latest: Vec<Reading>,
    pub fleet_stats: BTreeMap<Metric, StatsSnapshot>,
    pub levels: Vec<SeriesLevelView>,
    pub active_alerts: Vec<Alert>,
    pub summary: AlertSummary,
    pub thresholds: Vec<ThresholdConfig>,
    pub health: HealthReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepSummary {
    pub finalized_buckets: usize,
    pub quiet_series: usize,
    pub alerts: SweepReport,
}

pub struct Monitor {
    cfg: PipelineConfig,
    validator: Validator,
    aggregation: AggregationEngine,
    anomaly: AnomalyDetector,
    thresholds: ThresholdEvaluator,
    alerts: AlertManager,
    store: Arc<dyn Store>,
    events: EventBus,
    health: Arc<HealthState>,
    series_gates: KeyedGates<SeriesId>,
    threshold_gate: tokio::sync::Mutex<()>,
}

impl Monitor {
    /// Fresh monitor with default thresholds and no restored state.
    pub fn new(cfg: PipelineConfig, store: Arc<dyn Store>, now: DateTime<Utc>) -> Self {
        // ---
        let defaults = Metric::ALL
            .into_iter()
            .map(|metric| ThresholdConfig::defaults(metric, cfg.hysteresis_ratio, now))
            .collect();
        Self::assemble(cfg, store, defaults)
    }

    fn assemble(cfg: PipelineConfig, store: Arc<dyn Store>, thresholds: Vec<ThresholdConfig>) -> Self {
        // ---
        let events = EventBus::new(EVENT_CAPACITY);
        let health = Arc::new(HealthState::default());
        let alerts = AlertManager::new(
            cfg.alerts.clone(),
            cfg.retry.clone(),
            store.clone(),
            events.clone(),
            health.clone(),
        );

        Self {
            validator: Validator::new(cfg.validator.clone()),
            aggregation: AggregationEngine::new(cfg.aggregation.clone()),
            anomaly: AnomalyDetector::new(cfg.anomaly.clone()),
            thresholds: ThresholdEvaluator::new(thresholds, cfg.alerts.quiet_period),
            alerts,
            store,
            events,
            health,
            series_gates: KeyedGates::new(),
            threshold_gate: tokio::sync::Mutex::new(()),
            cfg,
        }
    }

    /// Build a monitor from persisted state: latest threshold versions
    /// (seeding defaults for metrics that have none), recent buckets, series
    /// statistics, the latest reading of every series and non-archived
    /// alerts.
    ///
    /// Series with a live threshold alert resume at the alert's severity, so
    /// a value inside the hysteresis gap neither clears nor re-raises it.
    pub async fn bootstrap(
        cfg: PipelineConfig,
        store: Arc<dyn Store>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        // ---
        let mut thresholds = store.load_thresholds().await?;
        for metric in Metric::ALL {
            if thresholds.iter().any(|t| t.metric == metric) {
                continue;
            }
            let defaults = ThresholdConfig::defaults(metric, cfg.hysteresis_ratio, now);
            with_backoff(&cfg.retry, "save_thresholds", || store.save_thresholds(&defaults)).await?;
            info!(metric = %metric, "Seeded default thresholds");
            thresholds.push(defaults);
        }

        let since = now - cfg.validator.retention_floor;
        let buckets = store.load_buckets(since).await?;
        let stats = store.load_series_stats().await?;
        let alerts = store.load_alerts().await?;
        let latest = store.load_latest_readings().await?;

        if cfg.validator.registered_devices.is_empty() {
            info!("Device registry is open: any device id is accepted");
        }

        let monitor = Self::assemble(cfg, store, thresholds);
        let by_series: HashMap<(String, Metric), Reading> = latest
            .iter()
            .map(|r| ((r.device_id.clone(), r.metric), r.clone()))
            .collect();
        monitor.aggregation.restore(buckets, stats, latest);
        monitor.alerts.restore(alerts);

        for alert in monitor.alerts.live_threshold_alerts() {
            let Some(reading) = by_series.get(&(alert.device_id.clone(), alert.metric)) else {
                continue;
            };
            let level = monitor.thresholds.restore_level(reading, alert.severity);
            debug!(device_id = %alert.device_id, metric = %alert.metric, ?level, "Restored threshold level");
        }
        Ok(monitor)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Submit raw JSON telemetry records. Every record gets its own outcome;
    /// a bad record never affects the others.
    pub async fn submit(&self, records: Vec<serde_json::Value>, now: DateTime<Utc>) -> Vec<RecordOutcome> {
        // ---
        let validated = records
            .iter()
            .map(|record| self.validator.validate_json(record, now))
            .collect();
        self.apply_batch(validated, now).await
    }

    /// Submit one multi-metric controller frame.
    pub async fn submit_frame(&self, frame: serde_json::Value, now: DateTime<Utc>) -> Vec<RecordOutcome> {
        // ---
        let frame: RawFrame = match serde_json::from_value(frame) {
            Ok(frame) => frame,
            Err(e) => {
                let reason = RejectionReason::Malformed {
                    detail: e.to_string(),
                };
                return vec![rejected(0, reason)];
            }
        };

        let records = frame.into_records();
        if records.is_empty() {
            let reason = RejectionReason::Malformed {
                detail: "frame carries no sensor values".to_string(),
            };
            return vec![rejected(0, reason)];
        }

        let validated = records
            .iter()
            .map(|raw| self.validator.validate(raw, now))
            .collect();
        self.apply_batch(validated, now).await
    }

    async fn apply_batch(
        &self,
        validated: Vec<std::result::Result<Reading, RejectionReason>>,
        now: DateTime<Utc>,
    ) -> Vec<RecordOutcome> {
        // ---
        let mut outcomes: Vec<Option<RecordOutcome>> = vec![None; validated.len()];
        let mut accepted = Vec::new();

        for (index, result) in validated.into_iter().enumerate() {
            match result {
                Ok(reading) => accepted.push((index, reading)),
                Err(reason) => {
                    info!(index, "Rejected telemetry record: {}", reason);
                    outcomes[index] = Some(rejected(index, reason));
                }
            }
        }

        // Stable: equal timestamps keep submission order.
        accepted.sort_by_key(|(_, reading)| reading.observed_at);
        for (index, reading) in accepted {
            outcomes[index] = Some(self.apply(index, reading, now).await);
        }

        outcomes.into_iter().flatten().collect()
    }

    async fn apply(&self, index: usize, reading: Reading, now: DateTime<Utc>) -> RecordOutcome {
        // ---
        let gate = self.series_gates.gate(&reading.series());
        let _guard = gate.lock().await;

        let inserted = with_backoff(&self.cfg.retry, "insert_reading", || {
            self.store.insert_reading(&reading)
        })
        .await;

        let fresh = match inserted {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(device_id = %reading.device_id, metric = %reading.metric, "Failed to store reading: {}", e);
                self.degrade(&format!("reading persistence failing: {e}"), now);
                return RecordOutcome::Failed {
                    index,
                    error: e.to_string(),
                };
            }
        };

        if !fresh {
            debug!(device_id = %reading.device_id, metric = %reading.metric, "Duplicate reading ignored");
            return RecordOutcome::Accepted {
                index,
                device_id: reading.device_id,
                metric: reading.metric,
                observed_at: reading.observed_at,
                duplicate: true,
                late_revision: false,
                alerts: Vec::new(),
            };
        }

        let outcome = self.aggregation.ingest(&reading, now);
        self.persist_aggregates(&outcome, now).await;
        self.events.emit(CoreEvent::ReadingApplied {
            reading: reading.clone(),
            late_revision: outcome.late_revision,
        });

        let alerts = self.evaluate(&reading, &outcome.prior, now).await;

        RecordOutcome::Accepted {
            index,
            device_id: reading.device_id,
            metric: reading.metric,
            observed_at: reading.observed_at,
            duplicate: false,
            late_revision: outcome.late_revision,
            alerts,
        }
    }

    /// Run both detectors on an applied reading and feed the alert manager.
    async fn evaluate(&self, reading: &Reading, prior: &StatsSnapshot, now: DateTime<Utc>) -> Vec<Uuid> {
        // ---
        let mut touched = Vec::new();

        let evaluation = self.thresholds.evaluate(reading);
        if let Some(severity) = evaluation.to.severity() {
            let update = self
                .alerts
                .on_trigger(Trigger {
                    device_id: reading.device_id.clone(),
                    metric: reading.metric,
                    origin: AlertOrigin::Threshold,
                    severity,
                    message: evaluation.message(),
                    at: now,
                    renewed: evaluation.reversed,
                })
                .await;
            touched.push(update.alert.id);
        }
        if evaluation.sustained_normal {
            self.alerts
                .on_sustained_normal(&reading.device_id, reading.metric, now)
                .await;
        }

        if let Some(signal) = self.anomaly.check(reading, prior) {
            debug!(device_id = %reading.device_id, metric = %reading.metric, z = signal.z_score, "Anomalous reading");
            let update = self
                .alerts
                .on_trigger(Trigger {
                    device_id: reading.device_id.clone(),
                    metric: reading.metric,
                    origin: AlertOrigin::Anomaly,
                    severity: signal.severity,
                    message: signal.message(),
                    at: now,
                    renewed: false,
                })
                .await;
            // Both detectors feed the same (device, metric) alert.
            if !touched.contains(&update.alert.id) {
                touched.push(update.alert.id);
            }
        }

        touched
    }

    async fn persist_aggregates(&self, outcome: &IngestOutcome, now: DateTime<Utc>) {
        // ---
        let mut failure = None;
        for bucket in &outcome.buckets {
            if let Err(e) = with_backoff(&self.cfg.retry, "upsert_bucket", || {
                self.store.upsert_bucket(bucket)
            })
            .await
            {
                failure = Some(e);
            }
        }
        for record in &outcome.stats {
            if let Err(e) = with_backoff(&self.cfg.retry, "upsert_series_stats", || {
                self.store.upsert_series_stats(record)
            })
            .await
            {
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => {
                warn!("Aggregate persistence failed, keeping in-memory state: {}", e);
                self.degrade(&format!("aggregate persistence failing: {e}"), now);
            }
            None if self.alerts.pending_writes() == 0 => self.health.recover(),
            None => {}
        }
    }

    fn degrade(&self, reason: &str, now: DateTime<Utc>) {
        if self.health.degrade(reason, now) {
            self.events.emit(CoreEvent::HealthDegraded {
                reason: reason.to_string(),
            });
        }
    }

    // ---

    pub fn latest(&self, device_id: Option<&str>, metric: Option<Metric>) -> Vec<Reading> {
        self.aggregation.latest(device_id, metric)
    }

    pub fn trend(
        &self,
        metric: Metric,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BucketAggregate>> {
        // ---
        if from > to {
            return Err(MonitorError::InvalidQuery(format!(
                "range start {from} is after end {to}"
            )));
        }
        Ok(self.aggregation.query_trend(metric, granularity, from, to))
    }

    /// Pearson matrix over the trailing `window`, optionally limited to one
    /// device's series.
    pub fn correlations(
        &self,
        window: Duration,
        device_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CorrelationMatrix> {
        // ---
        if window <= Duration::zero() || window > self.cfg.aggregation.correlation_horizon {
            return Err(MonitorError::InvalidQuery(format!(
                "correlation window must be positive and at most {} minutes",
                self.cfg.aggregation.correlation_horizon.num_minutes()
            )));
        }

        let from = now - window;
        let series: Vec<_> = self
            .aggregation
            .minute_series(from, now)
            .into_iter()
            .filter(|(id, _)| device_id.map_or(true, |d| id.device_id.as_deref() == Some(d)))
            .collect();

        Ok(compute_correlations(
            &series,
            self.cfg.min_correlation_overlap,
            from,
            now,
        ))
    }

    /// Per-day fleet summaries for the UTC days `from..=to`.
    pub fn daily_summaries(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailySummary>> {
        // ---
        if from > to {
            return Err(MonitorError::InvalidQuery(format!(
                "range start {from} is after end {to}"
            )));
        }
        if (to - from).num_days() >= MAX_SUMMARY_DAYS {
            return Err(MonitorError::InvalidQuery(format!(
                "summary range is limited to {MAX_SUMMARY_DAYS} days"
            )));
        }

        let start = Utc.from_utc_datetime(&from.and_time(NaiveTime::MIN));
        let last = Utc.from_utc_datetime(&to.and_time(NaiveTime::MIN));
        let buckets: Vec<BucketAggregate> = Metric::ALL
            .into_iter()
            .flat_map(|metric| self.aggregation.query_trend(metric, Granularity::Day, start, last))
            .collect();
        let alerts = self.alerts.list(&AlertQuery {
            since: Some(start),
            until: Some(last + Duration::days(1)),
            include_archived: true,
            ..AlertQuery::default()
        });

        Ok(summarize_days(from, to, &buckets, &alerts))
    }

    pub fn alerts(&self, query: &AlertQuery) -> Vec<Alert> {
        self.alerts.list(query)
    }

    pub fn alert_summary(&self, now: DateTime<Utc>) -> AlertSummary {
        self.alerts.summary(now)
    }

    pub fn alert(&self, id: Uuid) -> Result<Alert> {
        self.alerts
            .get(id)
            .ok_or_else(|| MonitorError::NotFound(format!("alert {id}")))
    }

    pub async fn acknowledge(&self, id: Uuid, now: DateTime<Utc>) -> Result<Alert> {
        self.alerts.acknowledge(id, now).await
    }

    pub fn thresholds(&self) -> Vec<ThresholdConfig> {
        self.thresholds.configs()
    }

    pub fn threshold(&self, metric: Metric) -> Result<ThresholdConfig> {
        self.thresholds
            .config(metric)
            .map(|cfg| cfg.as_ref().clone())
            .ok_or_else(|| MonitorError::NotFound(format!("thresholds for {metric}")))
    }

    /// Current hysteresis level of one series (normal if never seen).
    pub fn level(&self, device_id: &str, metric: Metric) -> Level {
        self.thresholds
            .levels()
            .into_iter()
            .find(|view| view.device_id == device_id && view.metric == metric)
            .map_or(Level::Normal, |view| view.level)
    }

    /// Replace `metric`'s bands if `expected_version` is still current. The
    /// new version is persisted before it is used for evaluation.
    pub async fn update_thresholds(
        &self,
        metric: Metric,
        expected_version: u64,
        bands: Vec<Band>,
        now: DateTime<Utc>,
    ) -> Result<ThresholdConfig> {
        // ---
        let _guard = self.threshold_gate.lock().await;

        let next = self
            .thresholds
            .prepare_update(metric, expected_version, bands, now)?;
        with_backoff(&self.cfg.retry, "save_thresholds", || {
            self.store.save_thresholds(&next)
        })
        .await?;

        self.thresholds.install(next.clone());
        info!(metric = %metric, version = next.version, "Thresholds updated");
        self.events.emit(CoreEvent::ThresholdsUpdated {
            metric,
            version: next.version,
        });
        Ok(next)
    }

    pub fn context_snapshot(&self, now: DateTime<Utc>) -> ContextSnapshot {
        // ---
        let fleet_stats = Metric::ALL
            .into_iter()
            .filter_map(|metric| {
                self.aggregation
                    .stats(&SeriesId::fleet(metric))
                    .map(|stats| (metric, stats))
            })
            .collect();

        ContextSnapshot {
            generated_at: now,
            latest: self.aggregation.latest(None, None),
            fleet_stats,
            levels: self.thresholds.levels(),
            active_alerts: self
                .alerts
                .list(&AlertQuery::default())
                .into_iter()
                .filter(|alert| alert.state.is_live())
                .collect(),
            summary: self.alerts.summary(now),
            thresholds: self.thresholds.configs(),
            health: self.health(),
        }
    }

    pub fn health(&self) -> HealthReport {
        self.health.report(self.alerts.pending_writes())
    }

    /// One maintenance pass: finalize elapsed buckets, close alerts of
    /// series that went quiet, then the alert sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepSummary {
        // ---
        let finalized = self.aggregation.finalize_elapsed(now);
        for bucket in &finalized {
            if let Err(e) = with_backoff(&self.cfg.retry, "upsert_bucket", || {
                self.store.upsert_bucket(bucket)
            })
            .await
            {
                warn!("Failed to persist finalized bucket: {}", e);
            }
        }

        let quiet = self.thresholds.quiet_series(now);
        for (device_id, metric) in &quiet {
            self.alerts.on_sustained_normal(device_id, *metric, now).await;
        }

        SweepSummary {
            finalized_buckets: finalized.len(),
            quiet_series: quiet.len(),
            alerts: self.alerts.sweep(now).await,
        }
    }

    /// Run `sweep` every `every` until `shutdown` flips to `true` or its
    /// sender is dropped. A zero period is raised to one millisecond.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: StdDuration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        // ---
        let every = every.max(StdDuration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Utc::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn rejected(index: usize, reason: RejectionReason) -> RecordOutcome {
    RecordOutcome::Rejected {
        index,
        message: reason.to_string(),
        reason,
    }
}
