//! Data models shared by every stage of the telemetry pipeline.
//!
//! Raw wire shapes (`RawReading`, `RawFrame`) are explicit serde schemas with
//! every field optional, so that a missing field becomes a per-record
//! rejection instead of a batch-wide deserialization failure. Everything past
//! the validator works with the strongly typed `Reading`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Environmental quantity reported by a sensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    Methane,
    OtherGas,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::Methane,
        Metric::OtherGas,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Methane => "methane",
            Metric::OtherGas => "other_gas",
        }
    }

    /// Human readable name used in alert messages.
    pub fn label(self) -> &'static str {
        match self {
            Metric::Temperature => "Temperature",
            Metric::Humidity => "Humidity",
            Metric::Methane => "Methane",
            Metric::OtherGas => "Other gas",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Metric::Temperature => "°C",
            Metric::Humidity => "%",
            Metric::Methane | Metric::OtherGas => " ppm",
        }
    }

    /// Value with its unit, e.g. `31.5°C` or `350 ppm`.
    pub fn format_value(self, value: f64) -> String {
        format!("{}{}", value, self.unit())
    }

    /// Inclusive range a physical sensor can report. Gas sensors are read
    /// through a 10-bit analog converter, hence the 0..=1023 span.
    pub fn physical_range(self) -> (f64, f64) {
        match self {
            Metric::Temperature => (0.0, 60.0),
            Metric::Humidity => (0.0, 100.0),
            Metric::Methane | Metric::OtherGas => (0.0, 1023.0),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Ok(Metric::Temperature),
            "humidity" => Ok(Metric::Humidity),
            "methane" | "ch4" => Ok(Metric::Methane),
            "other_gas" | "other_gases" => Ok(Metric::OtherGas),
            other => Err(format!("unknown metric '{other}'")),
        }
    }
}

/// Alert severity. Ordering is meaningful: `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Lifecycle state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Open,
    Acknowledged,
    Escalated,
    AutoClosed,
}

impl AlertState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertState::Open => "open",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Escalated => "escalated",
            AlertState::AutoClosed => "auto_closed",
        }
    }

    /// Live alerts absorb new triggers; closed ones never reopen.
    pub fn is_live(self) -> bool {
        !matches!(self, AlertState::AutoClosed)
    }
}

impl FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AlertState::Open),
            "acknowledged" => Ok(AlertState::Acknowledged),
            "escalated" => Ok(AlertState::Escalated),
            "auto_closed" => Ok(AlertState::AutoClosed),
            other => Err(format!("unknown alert state '{other}'")),
        }
    }
}

/// Which detector raised an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertOrigin {
    /// Policy violation: a configured threshold band was crossed.
    Threshold,
    /// Statistically unusual value relative to the rolling baseline.
    Anomaly,
}

impl AlertOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertOrigin::Threshold => "threshold",
            AlertOrigin::Anomaly => "anomaly",
        }
    }
}

impl FromStr for AlertOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threshold" => Ok(AlertOrigin::Threshold),
            "anomaly" => Ok(AlertOrigin::Anomaly),
            other => Err(format!("unknown alert origin '{other}'")),
        }
    }
}

/// Bucket width for pre-aggregated trend data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Hour, Granularity::Day];

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }

    pub fn span(self) -> Duration {
        match self {
            Granularity::Minute => Duration::minutes(1),
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        }
    }

    /// Start of the bucket containing `at`, aligned to the UTC epoch.
    pub fn bucket_start(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.span().num_seconds();
        let secs = at.timestamp().div_euclid(width) * width;
        DateTime::from_timestamp(secs, 0).unwrap_or(at)
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

// ---

/// One telemetry record exactly as submitted by a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawReading {
    // ---
    pub device_id: Option<String>,
    pub metric: Option<String>,
    pub value: Option<f64>,
    /// Device-side timestamp in any offset; normalized to UTC on validation.
    pub observed_at: Option<DateTime<FixedOffset>>,
}

/// Multi-metric frame as emitted by the field controllers: one sample of
/// every sensor on the board at a single instant.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFrame {
    // ---
    pub device_id: Option<String>,
    pub observed_at: Option<DateTime<FixedOffset>>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub methane: Option<f64>,
    #[serde(alias = "other_gas")]
    pub other_gases: Option<f64>,
}

impl RawFrame {
    /// Split the frame into one raw record per metric that is present.
    pub fn into_records(self) -> Vec<RawReading> {
        // ---
        let values = [
            (Metric::Temperature, self.temperature),
            (Metric::Humidity, self.humidity),
            (Metric::Methane, self.methane),
            (Metric::OtherGas, self.other_gases),
        ];

        values
            .into_iter()
            .filter_map(|(metric, value)| {
                value.map(|v| RawReading {
                    device_id: self.device_id.clone(),
                    metric: Some(metric.as_str().to_string()),
                    value: Some(v),
                    observed_at: self.observed_at,
                })
            })
            .collect()
    }
}

/// A validated telemetry sample. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub device_id: String,
    pub metric: Metric,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl Reading {
    pub fn series(&self) -> SeriesId {
        SeriesId::device(&self.device_id, self.metric)
    }
}

/// Identity of a statistics series: one device's metric, or the whole
/// fleet's metric when `device_id` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesId {
    pub device_id: Option<String>,
    pub metric: Metric,
}

impl SeriesId {
    pub fn device(device_id: &str, metric: Metric) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            metric,
        }
    }

    pub fn fleet(metric: Metric) -> Self {
        Self {
            device_id: None,
            metric,
        }
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_id {
            Some(device) => write!(f, "{device}/{}", self.metric),
            None => write!(f, "fleet/{}", self.metric),
        }
    }
}

// ---

/// A detected condition requiring operator attention.
///
/// One live alert exists per (device, metric); `origins` lists the detectors
/// whose condition is currently attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    // ---
    pub id: Uuid,
    pub device_id: String,
    pub metric: Metric,
    pub origins: BTreeSet<AlertOrigin>,
    pub severity: Severity,
    pub state: AlertState,
    pub triggered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// When the alert entered its current state; escalation deadlines are
    /// computed from this.
    pub state_changed_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub trigger_count: u32,
    pub message: String,
}

/// One entry of the append-only alert audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTransition {
    pub alert_id: Uuid,
    pub from: Option<AlertState>,
    pub to: AlertState,
    pub severity: Severity,
    pub trigger_count: u32,
    pub at: DateTime<Utc>,
    pub note: String,
}

impl AlertTransition {
    pub fn record(
        alert: &Alert,
        from: Option<AlertState>,
        at: DateTime<Utc>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            alert_id: alert.id,
            from,
            to: alert.state,
            severity: alert.severity,
            trigger_count: alert.trigger_count,
            at,
            note: note.into(),
        }
    }
}
