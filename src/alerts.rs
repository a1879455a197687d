//! Alert Lifecycle Manager.
//!
//! Owns every alert. Triggers from the threshold evaluator and the anomaly
//! detector are grouped per (device, metric) into one live alert, which
//! records every detector currently attached to it in `origins` and moves
//! through `open -> acknowledged | escalated -> auto_closed`. An alert closes
//! once no attached condition holds it open.
//!
//! Transitions for one key are serialized through an async per-key gate so
//! the in-memory change and its persistence happen in order; unrelated keys
//! never wait on each other. Persistence is retried with backoff; if it
//! still fails the write goes to an outbox that the sweeper drains under the
//! same gate, and the service reports itself degraded until it does. A
//! trigger is never dropped because the store is down.
//!
//! There is no durable timer: escalation and auto-closure are recomputed by
//! `sweep` from the persisted timestamps, so a restart loses nothing.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AlertConfig, RetryPolicy};
use crate::error::{MonitorError, Result};
use crate::events::{CoreEvent, EventBus, HealthState, NotificationChannel};
use crate::locks::KeyedGates;
use crate::models::{Alert, AlertOrigin, AlertState, AlertTransition, Metric, Severity};
use crate::retry::with_backoff;
use crate::store::Store;

// ---

/// Grouping key: many readings map to one live alert per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub device_id: String,
    pub metric: Metric,
}

impl AlertKey {
    pub fn new(device_id: &str, metric: Metric) -> Self {
        Self {
            device_id: device_id.to_string(),
            metric,
        }
    }
}

impl From<&Alert> for AlertKey {
    fn from(alert: &Alert) -> Self {
        Self::new(&alert.device_id, alert.metric)
    }
}

/// A detector's request to open or refresh an alert.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub device_id: String,
    pub metric: Metric,
    pub origin: AlertOrigin,
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Utc>,
    /// The detector reports a different condition than before (e.g. a
    /// series went from too low to too high). The live alert takes the new
    /// severity and message as-is and is reopened if acknowledged.
    pub renewed: bool,
}

impl Trigger {
    pub fn key(&self) -> AlertKey {
        AlertKey::new(&self.device_id, self.metric)
    }
}

/// What `on_trigger` did with a trigger.
#[derive(Debug, Clone)]
pub struct AlertUpdate {
    pub alert: Alert,
    pub created: bool,
    pub notified: bool,
}

/// Filter for `list`. Time bounds apply to `triggered_at`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub severity: Option<Severity>,
    pub state: Option<AlertState>,
    pub device_id: Option<String>,
    pub metric: Option<Metric>,
    pub origin: Option<AlertOrigin>,
    #[serde(default)]
    pub include_archived: bool,
}

impl AlertQuery {
    fn matches(&self, alert: &Alert) -> bool {
        // ---
        (self.include_archived || alert.archived_at.is_none())
            && self.since.map_or(true, |t| alert.triggered_at >= t)
            && self.until.map_or(true, |t| alert.triggered_at <= t)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.state.map_or(true, |s| alert.state == s)
            && self.device_id.as_ref().map_or(true, |d| &alert.device_id == d)
            && self.metric.map_or(true, |m| alert.metric == m)
            && self.origin.map_or(true, |o| alert.origins.contains(&o))
    }
}

/// Overall condition derived from the most severe live alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Optimal,
    Info,
    Warning,
    Critical,
}

impl SystemStatus {
    pub fn message(self) -> &'static str {
        match self {
            SystemStatus::Optimal => "All systems operating normally",
            SystemStatus::Info => "Minor environmental variations detected",
            SystemStatus::Warning => "Environmental conditions need monitoring",
            SystemStatus::Critical => "Immediate attention required",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSummary {
    pub status: SystemStatus,
    pub status_message: &'static str,
    pub active_count: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_metric: BTreeMap<Metric, usize>,
    pub oldest_active_age_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub escalated: usize,
    pub auto_closed: usize,
    pub archived: usize,
    pub flushed: usize,
}

#[derive(Default)]
struct Outbox {
    alerts: HashSet<Uuid>,
    transitions: Vec<AlertTransition>,
}

/// Result of clearing one detector's condition from a live alert.
enum Clearance {
    Closed(Alert, AlertTransition),
    Detached(Alert),
}

pub struct AlertManager {
    cfg: AlertConfig,
    retry: RetryPolicy,
    store: Arc<dyn Store>,
    events: EventBus,
    health: Arc<HealthState>,
    alerts: DashMap<Uuid, Alert>,
    live: DashMap<AlertKey, Uuid>,
    gates: KeyedGates<AlertKey>,
    outbox: Mutex<Outbox>,
}

impl AlertManager {
    pub fn new(
        cfg: AlertConfig,
        retry: RetryPolicy,
        store: Arc<dyn Store>,
        events: EventBus,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            cfg,
            retry,
            store,
            events,
            health,
            alerts: DashMap::new(),
            live: DashMap::new(),
            gates: KeyedGates::new(),
            outbox: Mutex::new(Outbox::default()),
        }
    }

    /// Reload alerts at startup. Escalation and closure deadlines follow
    /// from their timestamps on the next sweep.
    pub fn restore(&self, alerts: Vec<Alert>) {
        // ---
        for alert in alerts {
            if alert.state.is_live() && alert.archived_at.is_none() {
                let key = AlertKey::from(&alert);
                let current = self.live.get(&key).map(|id| *id.value());
                let newer = current
                    .and_then(|id| self.alerts.get(&id).map(|a| a.triggered_at))
                    .map_or(true, |triggered_at| alert.triggered_at > triggered_at);
                if newer {
                    self.live.insert(key, alert.id);
                }
            }
            self.alerts.insert(alert.id, alert);
        }
        info!(
            "Restored {} alerts ({} live)",
            self.alerts.len(),
            self.live.len()
        );
    }

    fn live_id(&self, key: &AlertKey) -> Option<Uuid> {
        self.live.get(key).map(|id| *id.value())
    }

    /// Live alerts carrying a threshold condition, for rebuilding threshold
    /// levels after a restart.
    pub fn live_threshold_alerts(&self) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| a.state.is_live() && a.origins.contains(&AlertOrigin::Threshold))
            .map(|a| a.value().clone())
            .collect()
    }

    /// Open a new alert for the trigger's key, or fold the trigger into the
    /// live one: attach the trigger's origin, bump `trigger_count`, raise
    /// (never lower) the severity, reopen an acknowledged alert whose
    /// severity rises.
    pub async fn on_trigger(&self, trigger: Trigger) -> AlertUpdate {
        // ---
        let key = trigger.key();
        let gate = self.gates.gate(&key);
        let _guard = gate.lock().await;

        let refreshed = self.live_id(&key).and_then(|id| {
            let mut alert = self.alerts.get_mut(&id)?;
            if !alert.state.is_live() {
                return None;
            }
            let (change, notified) = self.refresh(&mut alert, &trigger);
            Some((alert.clone(), change, notified))
        });

        let (alert, change, created, notified) = match refreshed {
            Some((alert, change, notified)) => (alert, change, false, notified),
            None => {
                let alert = Alert {
                    id: Uuid::new_v4(),
                    device_id: trigger.device_id.clone(),
                    metric: trigger.metric,
                    origins: BTreeSet::from([trigger.origin]),
                    severity: trigger.severity,
                    state: AlertState::Open,
                    triggered_at: trigger.at,
                    last_seen_at: trigger.at,
                    state_changed_at: trigger.at,
                    acknowledged_at: None,
                    closed_at: None,
                    last_notified_at: Some(trigger.at),
                    archived_at: None,
                    trigger_count: 1,
                    message: trigger.message.clone(),
                };
                self.alerts.insert(alert.id, alert.clone());
                self.live.insert(key, alert.id);
                info!(
                    alert_id = %alert.id,
                    device_id = %alert.device_id,
                    metric = %alert.metric,
                    origin = trigger.origin.as_str(),
                    "Alert opened: {}",
                    alert.message
                );
                let change = AlertTransition::record(&alert, None, trigger.at, "opened");
                (alert, Some(change), true, true)
            }
        };

        self.persist(&alert, change.as_ref(), trigger.at).await;

        if let Some(change) = &change {
            self.events.emit(CoreEvent::AlertStateChanged {
                alert: alert.clone(),
                from: change.from,
            });
        }
        if notified {
            self.events.emit(CoreEvent::AlertNotification {
                alert: alert.clone(),
                channel: NotificationChannel::Standard,
            });
        }

        AlertUpdate {
            alert,
            created,
            notified,
        }
    }

    /// Apply a trigger to a live alert. Returns the audit entry (if the
    /// condition or state changed) and whether to notify.
    fn refresh(&self, alert: &mut Alert, trigger: &Trigger) -> (Option<AlertTransition>, bool) {
        // ---
        if alert.origins.insert(trigger.origin) {
            debug!(
                alert_id = %alert.id,
                origin = trigger.origin.as_str(),
                "Detector attached to live alert"
            );
        }
        let raised = trigger.severity > alert.severity;
        alert.trigger_count = alert.trigger_count.saturating_add(1);
        alert.last_seen_at = alert.last_seen_at.max(trigger.at);

        if !raised && !trigger.renewed {
            let acknowledged = alert.state == AlertState::Acknowledged;
            let nth = alert.trigger_count % self.cfg.renotify_every.max(1) == 0;
            let cooled = alert
                .last_notified_at
                .map_or(true, |last| trigger.at - last >= self.cfg.cooldown);
            let notify = !acknowledged && (nth || cooled);
            if notify {
                alert.last_notified_at = Some(trigger.at);
            }
            return (None, notify);
        }

        let from = alert.state;
        alert.severity = trigger.severity;
        alert.message = trigger.message.clone();
        alert.last_notified_at = Some(trigger.at);

        let what = if raised {
            format!("severity raised to {}", trigger.severity)
        } else {
            format!("condition changed to {}", trigger.severity)
        };
        let note = if from == AlertState::Acknowledged {
            alert.state = AlertState::Open;
            alert.state_changed_at = trigger.at;
            alert.acknowledged_at = None;
            format!("reopened: {what}")
        } else {
            what
        };
        debug!(alert_id = %alert.id, "{}", note);

        let change = AlertTransition::record(alert, Some(from), trigger.at, note);
        (Some(change), true)
    }

    /// Operator acknowledgement. Cancels pending escalation. Acknowledging
    /// an alert that is already acknowledged or closed changes nothing.
    pub async fn acknowledge(&self, id: Uuid, now: DateTime<Utc>) -> Result<Alert> {
        // ---
        let not_found = || MonitorError::NotFound(format!("alert {id}"));
        let key = self
            .alerts
            .get(&id)
            .map(|alert| AlertKey::from(alert.value()))
            .ok_or_else(not_found)?;

        let gate = self.gates.gate(&key);
        let _guard = gate.lock().await;

        let (alert, change) = {
            let mut alert = self.alerts.get_mut(&id).ok_or_else(not_found)?;
            match alert.state {
                AlertState::Open | AlertState::Escalated => {
                    let from = alert.state;
                    alert.state = AlertState::Acknowledged;
                    alert.acknowledged_at = Some(now);
                    alert.state_changed_at = now;
                    let change = AlertTransition::record(&alert, Some(from), now, "acknowledged");
                    (alert.clone(), change)
                }
                AlertState::Acknowledged | AlertState::AutoClosed => return Ok(alert.clone()),
            }
        };

        info!(alert_id = %id, "Alert acknowledged");
        self.persist(&alert, Some(&change), now).await;
        self.events.emit(CoreEvent::AlertStateChanged {
            alert: alert.clone(),
            from: change.from,
        });
        Ok(alert)
    }

    /// A threshold series stayed normal for the quiet period: clear the
    /// threshold condition from its alert, closing the alert unless a recent
    /// anomaly still holds it open.
    pub async fn on_sustained_normal(
        &self,
        device_id: &str,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        // ---
        let key = AlertKey::new(device_id, metric);
        self.clear(&key, AlertOrigin::Threshold, now, "sustained normal readings")
            .await
    }

    /// Whether `other` still holds the alert open once another detector's
    /// condition has cleared. A threshold condition holds until the
    /// threshold evaluator clears it; an anomaly holds for the quiet period.
    fn holds_open(&self, alert: &Alert, other: AlertOrigin, now: DateTime<Utc>) -> bool {
        match other {
            AlertOrigin::Threshold => true,
            AlertOrigin::Anomaly => now - alert.last_seen_at < self.cfg.quiet_period,
        }
    }

    async fn clear(
        &self,
        key: &AlertKey,
        origin: AlertOrigin,
        now: DateTime<Utc>,
        note: &str,
    ) -> Option<Alert> {
        // ---
        let gate = self.gates.gate(key);
        let _guard = gate.lock().await;

        let id = self.live_id(key)?;
        let clearance = {
            let mut alert = self.alerts.get_mut(&id)?;
            if !alert.state.is_live() || !alert.origins.contains(&origin) {
                return None;
            }
            let held = alert
                .origins
                .iter()
                .any(|other| *other != origin && self.holds_open(&alert, *other, now));
            if held {
                alert.origins.remove(&origin);
                Clearance::Detached(alert.clone())
            } else {
                let from = alert.state;
                alert.state = AlertState::AutoClosed;
                alert.closed_at = Some(now);
                alert.state_changed_at = now;
                let change = AlertTransition::record(&alert, Some(from), now, note);
                Clearance::Closed(alert.clone(), change)
            }
        };

        match clearance {
            Clearance::Detached(alert) => {
                debug!(
                    alert_id = %alert.id,
                    origin = origin.as_str(),
                    "Condition cleared; alert still held open"
                );
                self.persist(&alert, None, now).await;
                None
            }
            Clearance::Closed(alert, change) => {
                self.live.remove(key);
                info!(alert_id = %alert.id, "Alert auto-closed: {}", note);
                self.persist(&alert, Some(&change), now).await;
                self.events.emit(CoreEvent::AlertStateChanged {
                    alert: alert.clone(),
                    from: change.from,
                });
                Some(alert)
            }
        }
    }

    async fn escalate(&self, key: &AlertKey, id: Uuid, now: DateTime<Utc>) -> bool {
        // ---
        let gate = self.gates.gate(key);
        let _guard = gate.lock().await;

        let (alert, change) = {
            let Some(mut alert) = self.alerts.get_mut(&id) else {
                return false;
            };
            // Re-check: acknowledged or closed since the sweep looked.
            if alert.state != AlertState::Open
                || now - alert.state_changed_at < self.cfg.escalation_timeout
            {
                return false;
            }
            alert.state = AlertState::Escalated;
            alert.state_changed_at = now;
            alert.last_notified_at = Some(now);
            let change = AlertTransition::record(
                &alert,
                Some(AlertState::Open),
                now,
                "unacknowledged past escalation timeout",
            );
            (alert.clone(), change)
        };

        warn!(alert_id = %id, "Alert escalated: {}", alert.message);
        self.persist(&alert, Some(&change), now).await;
        self.events.emit(CoreEvent::AlertStateChanged {
            alert: alert.clone(),
            from: change.from,
        });
        self.events.emit(CoreEvent::AlertNotification {
            alert,
            channel: NotificationChannel::Escalation,
        });
        true
    }

    async fn archive(&self, key: &AlertKey, id: Uuid, now: DateTime<Utc>) -> bool {
        // ---
        let gate = self.gates.gate(key);
        let _guard = gate.lock().await;

        let archived = {
            let Some(mut alert) = self.alerts.get_mut(&id) else {
                return false;
            };
            if alert.archived_at.is_some() {
                return false;
            }
            alert.archived_at = Some(now);
            alert.clone()
        };
        self.persist(&archived, None, now).await;
        true
    }

    /// Escalate overdue open alerts, clear quiet anomaly conditions, archive
    /// expired closed alerts and drain the outbox.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        // ---
        let mut to_escalate = Vec::new();
        let mut to_clear = Vec::new();
        let mut to_archive = Vec::new();
        for entry in self.alerts.iter() {
            let alert = entry.value();
            match alert.state {
                AlertState::Open if now - alert.state_changed_at >= self.cfg.escalation_timeout => {
                    to_escalate.push((AlertKey::from(alert), alert.id));
                }
                AlertState::AutoClosed
                    if alert.archived_at.is_none()
                        && alert
                            .closed_at
                            .is_some_and(|at| now - at >= self.cfg.retention) =>
                {
                    to_archive.push((AlertKey::from(alert), alert.id));
                }
                _ => {}
            }
            if alert.origins.contains(&AlertOrigin::Anomaly)
                && alert.state.is_live()
                && now - alert.last_seen_at >= self.cfg.quiet_period
            {
                to_clear.push(AlertKey::from(alert));
            }
        }

        let mut report = SweepReport::default();
        for key in to_clear {
            let closed = self
                .clear(&key, AlertOrigin::Anomaly, now, "no anomalies for the quiet period")
                .await;
            if closed.is_some() {
                report.auto_closed += 1;
            }
        }
        for (key, id) in to_escalate {
            if self.escalate(&key, id, now).await {
                report.escalated += 1;
            }
        }
        for (key, id) in to_archive {
            if self.archive(&key, id, now).await {
                report.archived += 1;
            }
        }
        report.flushed = self.flush_outbox().await;

        if report != SweepReport::default() {
            debug!(?report, "Alert sweep");
        }
        report
    }

    async fn persist(&self, alert: &Alert, change: Option<&AlertTransition>, now: DateTime<Utc>) {
        // ---
        let saved = with_backoff(&self.retry, "upsert_alert", || self.store.upsert_alert(alert)).await;
        let result = match (saved, change) {
            (Ok(()), Some(change)) => with_backoff(&self.retry, "append_transition", || {
                self.store.append_transition(change)
            })
            .await
            .map_err(|e| (e, false)),
            (Ok(()), None) => Ok(()),
            (Err(e), _) => Err((e, true)),
        };

        let Err((e, alert_pending)) = result else {
            return;
        };

        warn!(alert_id = %alert.id, "Alert write queued for redelivery: {}", e);
        {
            let mut outbox = self.outbox.lock();
            if alert_pending {
                outbox.alerts.insert(alert.id);
            }
            if let Some(change) = change {
                outbox.transitions.push(change.clone());
            }
        }
        let reason = format!("alert persistence failing: {e}");
        if self.health.degrade(&reason, now) {
            self.events.emit(CoreEvent::HealthDegraded { reason });
        }
    }

    /// Re-persist queued writes. Each alert is written in its current
    /// in-memory state while holding its key's gate, so a newer write for
    /// the same alert cannot land first. Returns how many writes went
    /// through.
    async fn flush_outbox(&self) -> usize {
        // ---
        let pending = std::mem::take(&mut *self.outbox.lock());
        if pending.alerts.is_empty() && pending.transitions.is_empty() {
            return 0;
        }

        let mut flushed = 0;
        let mut retry_alerts = HashSet::new();
        for id in pending.alerts {
            let Some(key) = self.alerts.get(&id).map(|a| AlertKey::from(a.value())) else {
                continue;
            };
            let gate = self.gates.gate(&key);
            let _guard = gate.lock().await;

            let Some(alert) = self.get(id) else {
                continue;
            };
            match self.store.upsert_alert(&alert).await {
                Ok(()) => flushed += 1,
                Err(_) => {
                    retry_alerts.insert(id);
                }
            }
        }

        let mut transitions = pending.transitions.into_iter();
        let mut retry_transitions = Vec::new();
        for change in transitions.by_ref() {
            if self.store.append_transition(&change).await.is_err() {
                retry_transitions.push(change);
                break;
            }
            flushed += 1;
        }
        retry_transitions.extend(transitions);

        let drained = {
            let mut outbox = self.outbox.lock();
            outbox.alerts.extend(retry_alerts);
            // Older entries go first.
            retry_transitions.append(&mut outbox.transitions);
            outbox.transitions = retry_transitions;
            outbox.alerts.is_empty() && outbox.transitions.is_empty()
        };

        if drained {
            info!("Alert outbox drained ({} writes)", flushed);
            self.health.recover();
        }
        flushed
    }

    pub fn pending_writes(&self) -> usize {
        let outbox = self.outbox.lock();
        outbox.alerts.len() + outbox.transitions.len()
    }

    pub fn get(&self, id: Uuid) -> Option<Alert> {
        self.alerts.get(&id).map(|alert| alert.value().clone())
    }

    /// Matching alerts, most recently triggered first.
    pub fn list(&self, query: &AlertQuery) -> Vec<Alert> {
        // ---
        let mut alerts: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|alert| query.matches(alert.value()))
            .map(|alert| alert.value().clone())
            .collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        alerts
    }

    pub fn summary(&self, now: DateTime<Utc>) -> AlertSummary {
        // ---
        let active: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| a.state.is_live())
            .map(|a| a.value().clone())
            .collect();

        let mut by_severity = BTreeMap::new();
        let mut by_metric = BTreeMap::new();
        for alert in &active {
            *by_severity.entry(alert.severity).or_insert(0) += 1;
            *by_metric.entry(alert.metric).or_insert(0) += 1;
        }

        let status = match active.iter().map(|a| a.severity).max() {
            Some(Severity::Critical) => SystemStatus::Critical,
            Some(Severity::Warning) => SystemStatus::Warning,
            Some(Severity::Info) => SystemStatus::Info,
            None => SystemStatus::Optimal,
        };

        AlertSummary {
            status,
            status_message: status.message(),
            active_count: active.len(),
            by_severity,
            by_metric,
            oldest_active_age_minutes: active
                .iter()
                .map(|a| a.triggered_at)
                .min()
                .map(|oldest| (now - oldest).num_minutes()),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::{LaggingStore, MemoryStore};
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;
    use tokio::sync::broadcast::Receiver;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            base_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(2),
        }
    }

    fn manager(store: Arc<dyn Store>) -> (AlertManager, Receiver<CoreEvent>, Arc<HealthState>) {
        let events = EventBus::new(64);
        let rx = events.subscribe();
        let health = Arc::new(HealthState::default());
        let mgr = AlertManager::new(
            AlertConfig::default(),
            fast_retry(),
            store,
            events,
            health.clone(),
        );
        (mgr, rx, health)
    }

    fn trigger(severity: Severity, minute: i64) -> Trigger {
        Trigger {
            device_id: "s1".to_string(),
            metric: Metric::Methane,
            origin: AlertOrigin::Threshold,
            severity,
            message: format!("{} methane", severity),
            at: t0() + Duration::minutes(minute),
            renewed: false,
        }
    }

    fn anomaly(severity: Severity, minute: i64) -> Trigger {
        Trigger {
            origin: AlertOrigin::Anomaly,
            ..trigger(severity, minute)
        }
    }

    fn notifications(rx: &mut Receiver<CoreEvent>) -> Vec<NotificationChannel> {
        let mut channels = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::AlertNotification { channel, .. } = event {
                channels.push(channel);
            }
        }
        channels
    }

    #[tokio::test]
    async fn test_repeated_triggers_dedup_into_one_alert() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (mgr, mut rx, _) = manager(store.clone());

        let first = mgr.on_trigger(trigger(Severity::Critical, 0)).await;
        let second = mgr.on_trigger(trigger(Severity::Critical, 1)).await;

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.alert.id, second.alert.id);
        assert_eq!(second.alert.trigger_count, 2);
        assert_eq!(mgr.list(&AlertQuery::default()).len(), 1);
        assert_eq!(notifications(&mut rx), vec![NotificationChannel::Standard]);
        assert_eq!(store.alert(first.alert.id).unwrap().trigger_count, 2);
    }

    #[tokio::test]
    async fn test_severity_raises_but_never_lowers() {
        // ---
        let (mgr, mut rx, _) = manager(Arc::new(MemoryStore::new()));

        mgr.on_trigger(trigger(Severity::Warning, 0)).await;
        let raised = mgr.on_trigger(trigger(Severity::Critical, 1)).await;
        let lower = mgr.on_trigger(trigger(Severity::Warning, 2)).await;

        assert!(raised.notified);
        assert_eq!(lower.alert.severity, Severity::Critical);
        assert_eq!(lower.alert.message, "critical methane");
        assert_eq!(notifications(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_renotify_after_cooldown() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));

        mgr.on_trigger(trigger(Severity::Warning, 0)).await;
        assert!(!mgr.on_trigger(trigger(Severity::Warning, 14)).await.notified);
        assert!(mgr.on_trigger(trigger(Severity::Warning, 15)).await.notified);
    }

    #[tokio::test]
    async fn test_unacknowledged_alert_escalates() {
        // ---
        let (mgr, mut rx, _) = manager(Arc::new(MemoryStore::new()));
        let id = mgr.on_trigger(trigger(Severity::Critical, 0)).await.alert.id;
        notifications(&mut rx);

        let early = mgr.sweep(t0() + Duration::minutes(29)).await;
        assert_eq!(early.escalated, 0);

        let due = mgr.sweep(t0() + Duration::minutes(30)).await;
        assert_eq!(due.escalated, 1);
        assert_eq!(mgr.get(id).unwrap().state, AlertState::Escalated);
        assert_eq!(notifications(&mut rx), vec![NotificationChannel::Escalation]);

        // Escalation happens once.
        assert_eq!(mgr.sweep(t0() + Duration::minutes(90)).await.escalated, 0);
    }

    #[tokio::test]
    async fn test_acknowledge_cancels_escalation_and_raise_reopens() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));
        let id = mgr.on_trigger(trigger(Severity::Warning, 0)).await.alert.id;

        let acked = mgr.acknowledge(id, t0() + Duration::minutes(5)).await.unwrap();
        assert_eq!(acked.state, AlertState::Acknowledged);
        assert_eq!(mgr.sweep(t0() + Duration::hours(2)).await.escalated, 0);

        // Still-warning triggers do not reopen or re-notify.
        let same = mgr.on_trigger(trigger(Severity::Warning, 130)).await;
        assert_eq!(same.alert.state, AlertState::Acknowledged);
        assert!(!same.notified);

        let raised = mgr.on_trigger(trigger(Severity::Critical, 131)).await;
        assert_eq!(raised.alert.state, AlertState::Open);
        assert_eq!(raised.alert.acknowledged_at, None);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_alert() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));
        let err = mgr.acknowledge(Uuid::new_v4(), t0()).await.unwrap_err();
        assert!(matches!(err, MonitorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sustained_normal_closes_and_next_trigger_opens_new_alert() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (mgr, _rx, _) = manager(store.clone());
        let first = mgr.on_trigger(trigger(Severity::Warning, 0)).await.alert;

        let closed = mgr
            .on_sustained_normal("s1", Metric::Methane, t0() + Duration::minutes(20))
            .await
            .unwrap();
        assert_eq!(closed.state, AlertState::AutoClosed);
        assert!(mgr
            .on_sustained_normal("s1", Metric::Methane, t0() + Duration::minutes(21))
            .await
            .is_none());

        let next = mgr.on_trigger(trigger(Severity::Warning, 30)).await;
        assert!(next.created);
        assert_ne!(next.alert.id, first.id);

        let audit: Vec<_> = store
            .transitions()
            .into_iter()
            .filter(|t| t.alert_id == first.id)
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            audit,
            vec![
                (None, AlertState::Open),
                (Some(AlertState::Open), AlertState::AutoClosed),
            ]
        );
    }

    #[tokio::test]
    async fn test_quiet_anomaly_alert_auto_closes() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));
        let id = mgr.on_trigger(anomaly(Severity::Warning, 0)).await.alert.id;

        assert_eq!(mgr.sweep(t0() + Duration::minutes(9)).await.auto_closed, 0);
        assert_eq!(mgr.sweep(t0() + Duration::minutes(10)).await.auto_closed, 1);
        assert_eq!(mgr.get(id).unwrap().state, AlertState::AutoClosed);
    }

    #[tokio::test]
    async fn test_store_outage_queues_writes_and_degrades() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (mgr, mut rx, health) = manager(store.clone());
        store.fail_next_writes(100);

        let update = mgr.on_trigger(trigger(Severity::Critical, 0)).await;
        assert!(update.created, "trigger applied despite the outage");
        assert!(mgr.pending_writes() > 0);
        assert_eq!(health.report(0).status, "degraded");

        let degraded = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| matches!(e, CoreEvent::HealthDegraded { .. }));
        assert!(degraded);

        store.fail_next_writes(0);
        let report = mgr.sweep(t0() + Duration::minutes(1)).await;
        assert_eq!(report.flushed, 2);
        assert_eq!(mgr.pending_writes(), 0);
        assert_eq!(health.report(0).status, "ok");
        assert!(store.alert(update.alert.id).is_some());
    }

    #[tokio::test]
    async fn test_closed_alerts_archive_after_retention() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));
        let id = mgr.on_trigger(trigger(Severity::Warning, 0)).await.alert.id;
        mgr.on_sustained_normal("s1", Metric::Methane, t0()).await;

        let report = mgr.sweep(t0() + Duration::days(91)).await;
        assert_eq!(report.archived, 1);
        assert!(mgr.list(&AlertQuery::default()).is_empty());

        let all = mgr.list(&AlertQuery {
            include_archived: true,
            ..AlertQuery::default()
        });
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
    }

    #[tokio::test]
    async fn test_summary_reports_worst_status() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));
        assert_eq!(mgr.summary(t0()).status, SystemStatus::Optimal);

        mgr.on_trigger(trigger(Severity::Warning, 0)).await;
        let mut humid = trigger(Severity::Critical, 5);
        humid.metric = Metric::Humidity;
        mgr.on_trigger(humid).await;

        let summary = mgr.summary(t0() + Duration::minutes(12));
        assert_eq!(summary.status, SystemStatus::Critical);
        assert_eq!(summary.active_count, 2);
        assert_eq!(summary.by_severity.get(&Severity::Warning), Some(&1));
        assert_eq!(summary.by_metric.get(&Metric::Humidity), Some(&1));
        assert_eq!(summary.oldest_active_age_minutes, Some(12));
    }

    #[tokio::test]
    async fn test_threshold_and_anomaly_share_one_alert() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));
        let first = mgr.on_trigger(trigger(Severity::Warning, 0)).await;
        let second = mgr.on_trigger(anomaly(Severity::Critical, 1)).await;

        assert!(!second.created);
        assert_eq!(first.alert.id, second.alert.id);
        assert_eq!(
            second.alert.origins,
            BTreeSet::from([AlertOrigin::Threshold, AlertOrigin::Anomaly])
        );
        assert_eq!(second.alert.severity, Severity::Critical);
        assert_eq!(mgr.list(&AlertQuery::default()).len(), 1);

        let by_origin = mgr.list(&AlertQuery {
            origin: Some(AlertOrigin::Anomaly),
            ..AlertQuery::default()
        });
        assert_eq!(by_origin.len(), 1);
    }

    #[tokio::test]
    async fn test_recent_anomaly_holds_alert_after_threshold_recovers() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));
        let id = mgr.on_trigger(trigger(Severity::Warning, 0)).await.alert.id;
        mgr.on_trigger(anomaly(Severity::Warning, 5)).await;

        let closed = mgr
            .on_sustained_normal("s1", Metric::Methane, t0() + Duration::minutes(8))
            .await;
        assert!(closed.is_none());
        let alert = mgr.get(id).unwrap();
        assert!(alert.state.is_live());
        assert_eq!(alert.origins, BTreeSet::from([AlertOrigin::Anomaly]));

        assert_eq!(mgr.sweep(t0() + Duration::minutes(14)).await.auto_closed, 0);
        assert_eq!(mgr.sweep(t0() + Duration::minutes(15)).await.auto_closed, 1);
        assert_eq!(mgr.get(id).unwrap().state, AlertState::AutoClosed);
    }

    #[tokio::test]
    async fn test_quiet_anomaly_leaves_threshold_alert_open() {
        // ---
        let (mgr, _rx, _) = manager(Arc::new(MemoryStore::new()));
        let id = mgr.on_trigger(trigger(Severity::Critical, 0)).await.alert.id;
        mgr.on_trigger(anomaly(Severity::Warning, 1)).await;

        let report = mgr.sweep(t0() + Duration::minutes(12)).await;
        assert_eq!(report.auto_closed, 0);

        let alert = mgr.get(id).unwrap();
        assert_eq!(alert.state, AlertState::Open);
        assert_eq!(alert.origins, BTreeSet::from([AlertOrigin::Threshold]));
    }

    #[tokio::test]
    async fn test_renewed_trigger_replaces_condition_and_reopens() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let (mgr, _rx, _) = manager(store.clone());
        let id = mgr.on_trigger(trigger(Severity::Critical, 0)).await.alert.id;
        mgr.acknowledge(id, t0() + Duration::minutes(1)).await.unwrap();

        let update = mgr
            .on_trigger(Trigger {
                message: "WARNING: Temperature high (33°C)".to_string(),
                renewed: true,
                ..trigger(Severity::Warning, 2)
            })
            .await;

        assert!(update.notified);
        assert_eq!(update.alert.id, id);
        assert_eq!(update.alert.state, AlertState::Open);
        assert_eq!(update.alert.severity, Severity::Warning);
        assert_eq!(update.alert.message, "WARNING: Temperature high (33°C)");

        let last = store.transitions().pop().unwrap();
        assert_eq!(last.note, "reopened: condition changed to warning");
    }

    #[tokio::test]
    async fn test_outbox_flush_cannot_overwrite_newer_alert_write() {
        // ---
        let store = Arc::new(LaggingStore::new(StdDuration::from_millis(50)));
        let (mgr, _rx, _) = manager(store.clone());
        store.inner.fail_next_writes(2);

        let first = mgr.on_trigger(trigger(Severity::Warning, 0)).await;
        assert_eq!(mgr.pending_writes(), 2);

        // The queued write (trigger_count 1) is held back by the store while
        // a second trigger arrives for the same alert.
        let (report, second) = tokio::join!(mgr.sweep(t0() + Duration::minutes(1)), async {
            tokio::task::yield_now().await;
            mgr.on_trigger(trigger(Severity::Warning, 1)).await
        });

        assert_eq!(report.flushed, 2);
        assert_eq!(second.alert.trigger_count, 2);
        assert_eq!(store.inner.alert(first.alert.id).unwrap().trigger_count, 2);
    }
}
