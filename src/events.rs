//! Event emission contract between the core and external transports.
//!
//! The core never pushes to clients itself. The Aggregation Engine and the
//! Alert Lifecycle Manager emit `CoreEvent`s on a broadcast channel; any
//! transport (websocket fan-out, notification workers, actuators) subscribes
//! and does its own delivery. Emitting with no subscribers is not an error.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{Alert, AlertState, Metric, Reading};

/// Channel an alert notification is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Standard,
    /// Higher-priority channel used when an alert escalates.
    Escalation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    ReadingApplied {
        reading: Reading,
        late_revision: bool,
    },
    AlertStateChanged {
        alert: Alert,
        from: Option<AlertState>,
    },
    AlertNotification {
        alert: Alert,
        channel: NotificationChannel,
    },
    HealthDegraded {
        reason: String,
    },
    ThresholdsUpdated {
        metric: Metric,
        version: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped: no subscribers");
        }
    }
}

// ---

/// Degradation signal raised when persistence retries are exhausted.
#[derive(Debug, Default)]
pub struct HealthState {
    inner: Mutex<HealthInner>,
}

#[derive(Debug, Default, Clone)]
struct HealthInner {
    degraded_since: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub degraded_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Alert writes waiting for redelivery to the store.
    pub pending_writes: usize,
}

impl HealthState {
    /// Mark the system degraded. Returns `true` if it was healthy before.
    pub fn degrade(&self, reason: &str, now: DateTime<Utc>) -> bool {
        // ---
        let mut inner = self.inner.lock();
        inner.last_error = Some(reason.to_string());
        if inner.degraded_since.is_none() {
            inner.degraded_since = Some(now);
            return true;
        }
        false
    }

    pub fn recover(&self) {
        let mut inner = self.inner.lock();
        inner.degraded_since = None;
    }

    pub fn report(&self, pending_writes: usize) -> HealthReport {
        // ---
        let inner = self.inner.lock().clone();
        HealthReport {
            status: if inner.degraded_since.is_some() {
                "degraded"
            } else {
                "ok"
            },
            degraded_since: inner.degraded_since,
            last_error: inner.last_error,
            pending_writes,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        // ---
        let bus = EventBus::new(4);
        bus.emit(CoreEvent::HealthDegraded {
            reason: "nobody listening".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        // ---
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::ThresholdsUpdated {
            metric: Metric::Methane,
            version: 2,
        });

        match rx.recv().await {
            Ok(CoreEvent::ThresholdsUpdated { metric, version }) => {
                assert_eq!(metric, Metric::Methane);
                assert_eq!(version, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_health_degrade_and_recover() {
        // ---
        let health = HealthState::default();
        let now = Utc::now();

        assert!(health.degrade("store down", now));
        assert!(!health.degrade("still down", now));

        let report = health.report(3);
        assert_eq!(report.status, "degraded");
        assert_eq!(report.pending_writes, 3);
        assert_eq!(report.last_error.as_deref(), Some("still down"));

        health.recover();
        assert_eq!(health.report(0).status, "ok");
    }
}
