//! Threshold & Hysteresis Evaluator.
//!
//! Each metric has a versioned `ThresholdConfig`: severity bands with an
//! activation bound and a less extreme deactivation bound. Each
//! (device, metric) series carries a level (normal, info, warning, critical)
//! that only rises when an activation bound is crossed and only falls when
//! the current band's deactivation bound is crossed, so a value hovering
//! around one bound cannot toggle the alert state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MonitorError, Result};
use crate::models::{Metric, Reading, Severity};

// ---

/// Side of the bound a band alarms on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub severity: Severity,
    pub direction: Direction,
    pub activation: f64,
    pub deactivation: f64,
}

impl Band {
    pub fn above(severity: Severity, activation: f64, deactivation: f64) -> Self {
        Self {
            severity,
            direction: Direction::Above,
            activation,
            deactivation,
        }
    }

    pub fn below(severity: Severity, activation: f64, deactivation: f64) -> Self {
        Self {
            severity,
            direction: Direction::Below,
            activation,
            deactivation,
        }
    }

    /// Strictly beyond the activation bound.
    fn activated_by(&self, value: f64) -> bool {
        match self.direction {
            Direction::Above => value > self.activation,
            Direction::Below => value < self.activation,
        }
    }

    /// Not yet back past the deactivation bound.
    fn held_by(&self, value: f64) -> bool {
        match self.direction {
            Direction::Above => value >= self.deactivation,
            Direction::Below => value <= self.deactivation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub metric: Metric,
    pub version: u64,
    pub bands: Vec<Band>,
    pub updated_at: DateTime<Utc>,
}

impl ThresholdConfig {
    /// Deployed field policy for `metric`. Deactivation bounds sit
    /// `hysteresis_ratio` inside each activation bound.
    pub fn defaults(metric: Metric, hysteresis_ratio: f64, now: DateTime<Utc>) -> Self {
        // ---
        let above = |severity, at: f64| Band::above(severity, at, at * (1.0 - hysteresis_ratio));
        let below = |severity, at: f64| Band::below(severity, at, at * (1.0 + hysteresis_ratio));

        let bands = match metric {
            Metric::Temperature => vec![
                above(Severity::Warning, 32.0),
                above(Severity::Critical, 35.0),
                below(Severity::Warning, 18.0),
                below(Severity::Critical, 15.0),
            ],
            Metric::Humidity => vec![
                above(Severity::Warning, 75.0),
                above(Severity::Critical, 80.0),
                below(Severity::Warning, 45.0),
                below(Severity::Critical, 40.0),
            ],
            Metric::Methane => vec![
                above(Severity::Warning, 200.0),
                above(Severity::Critical, 300.0),
            ],
            Metric::OtherGas => vec![
                above(Severity::Warning, 300.0),
                above(Severity::Critical, 400.0),
            ],
        };

        Self {
            metric,
            version: 1,
            bands,
            updated_at: now,
        }
    }

    /// Check band shape: finite bounds, a real hysteresis gap on the
    /// triggering side, one band per (severity, direction), and more severe
    /// bands at least as extreme as milder ones.
    pub fn validate_bands(bands: &[Band]) -> Result<()> {
        // ---
        for band in bands {
            if !band.activation.is_finite() || !band.deactivation.is_finite() {
                return Err(MonitorError::InvalidThresholds(format!(
                    "{} band bounds must be finite",
                    band.severity
                )));
            }
            let gap_ok = match band.direction {
                Direction::Above => band.deactivation < band.activation,
                Direction::Below => band.deactivation > band.activation,
            };
            if !gap_ok {
                return Err(MonitorError::InvalidThresholds(format!(
                    "{} band deactivation {} must be strictly less extreme than activation {}",
                    band.severity, band.deactivation, band.activation
                )));
            }
        }

        for (i, a) in bands.iter().enumerate() {
            for b in &bands[i + 1..] {
                if a.direction != b.direction {
                    continue;
                }
                if a.severity == b.severity {
                    return Err(MonitorError::InvalidThresholds(format!(
                        "duplicate {} band for the same direction",
                        a.severity
                    )));
                }
                let (milder, harsher) = if a.severity < b.severity { (a, b) } else { (b, a) };
                let ordered = match a.direction {
                    Direction::Above => harsher.activation >= milder.activation,
                    Direction::Below => harsher.activation <= milder.activation,
                };
                if !ordered {
                    return Err(MonitorError::InvalidThresholds(format!(
                        "{} activation must be at least as extreme as {}",
                        harsher.severity, milder.severity
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---

/// Current alarm level of a series. `Normal` sorts below every severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Normal,
    Info,
    Warning,
    Critical,
}

impl Level {
    pub fn severity(self) -> Option<Severity> {
        match self {
            Level::Normal => None,
            Level::Info => Some(Severity::Info),
            Level::Warning => Some(Severity::Warning),
            Level::Critical => Some(Severity::Critical),
        }
    }
}

impl From<Severity> for Level {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Info => Level::Info,
            Severity::Warning => Level::Warning,
            Severity::Critical => Level::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Up,
    Down,
    Steady,
}

/// Result of evaluating one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub device_id: String,
    pub metric: Metric,
    pub value: f64,
    pub from: Level,
    pub to: Level,
    pub kind: TransitionKind,
    /// Direction of the band that holds the new level.
    pub direction: Option<Direction>,
    /// Jumped from one side of the bands to the other without passing
    /// through normal. Always reported as `Up`.
    pub reversed: bool,
    pub config_version: u64,
    /// Series has been normal for the full quiet period; reported once per
    /// normal stretch.
    pub sustained_normal: bool,
}

impl Evaluation {
    pub fn message(&self) -> String {
        // ---
        let value = self.metric.format_value(self.value);
        let label = self.metric.label();
        match (self.to, self.direction) {
            (Level::Critical, Some(Direction::Below)) => format!("CRITICAL: {label} too low ({value})"),
            (Level::Critical, _) => format!("CRITICAL: {label} too high ({value})"),
            (Level::Warning, Some(Direction::Below)) => format!("WARNING: {label} low ({value})"),
            (Level::Warning, _) => format!("WARNING: {label} high ({value})"),
            (Level::Info, _) => format!("INFO: {label} outside optimal range ({value})"),
            (Level::Normal, _) => format!("{label} is normal ({value})"),
        }
    }
}

#[derive(Debug, Clone)]
struct SeriesLevel {
    level: Level,
    direction: Option<Direction>,
    normal_since: Option<DateTime<Utc>>,
    closure_signalled: bool,
}

impl Default for SeriesLevel {
    fn default() -> Self {
        Self {
            level: Level::Normal,
            direction: None,
            normal_since: None,
            closure_signalled: false,
        }
    }
}

/// Read-only view of one series' level, for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesLevelView {
    pub device_id: String,
    pub metric: Metric,
    pub level: Level,
    pub normal_since: Option<DateTime<Utc>>,
}

type LevelKey = (String, Metric);

pub struct ThresholdEvaluator {
    quiet_period: Duration,
    configs: DashMap<Metric, Arc<ThresholdConfig>>,
    levels: DashMap<LevelKey, Arc<Mutex<SeriesLevel>>>,
}

impl ThresholdEvaluator {
    pub fn new(configs: Vec<ThresholdConfig>, quiet_period: Duration) -> Self {
        // ---
        let configs = configs
            .into_iter()
            .map(|cfg| (cfg.metric, Arc::new(cfg)))
            .collect();
        Self {
            quiet_period,
            configs,
            levels: DashMap::new(),
        }
    }

    /// Config version current right now. Readings hold on to the `Arc` they
    /// were evaluated with; later updates never affect past evaluations.
    pub fn config(&self, metric: Metric) -> Option<Arc<ThresholdConfig>> {
        self.configs.get(&metric).map(|cfg| cfg.value().clone())
    }

    pub fn configs(&self) -> Vec<ThresholdConfig> {
        // ---
        let mut all: Vec<ThresholdConfig> = self
            .configs
            .iter()
            .map(|cfg| cfg.value().as_ref().clone())
            .collect();
        all.sort_by_key(|cfg| cfg.metric);
        all
    }

    /// Build the next version of `metric`'s config. Fails with
    /// `ConfigConflict` if `expected_version` is not the current version.
    /// Nothing changes until `install` is called.
    pub fn prepare_update(
        &self,
        metric: Metric,
        expected_version: u64,
        bands: Vec<Band>,
        now: DateTime<Utc>,
    ) -> Result<ThresholdConfig> {
        // ---
        let current = self.config(metric).map_or(0, |cfg| cfg.version);
        if current != expected_version {
            return Err(MonitorError::ConfigConflict {
                metric,
                expected: expected_version,
                current,
            });
        }
        ThresholdConfig::validate_bands(&bands)?;

        Ok(ThresholdConfig {
            metric,
            version: current + 1,
            bands,
            updated_at: now,
        })
    }

    pub fn install(&self, config: ThresholdConfig) {
        debug!(metric = %config.metric, version = config.version, "Installing threshold config");
        self.configs.insert(config.metric, Arc::new(config));
    }

    fn slot(&self, key: &LevelKey) -> Arc<Mutex<SeriesLevel>> {
        // ---
        if let Some(slot) = self.levels.get(key) {
            return slot.value().clone();
        }
        self.levels.entry(key.clone()).or_default().value().clone()
    }

    pub fn evaluate(&self, reading: &Reading) -> Evaluation {
        // ---
        let config = self.config(reading.metric);
        let bands: &[Band] = config.as_deref().map_or(&[], |cfg| cfg.bands.as_slice());
        let value = reading.value;

        let slot = self.slot(&(reading.device_id.clone(), reading.metric));
        let mut state = slot.lock();
        let from = state.level;

        let held = held_level(bands, state.level, state.direction, value);
        let activated = bands
            .iter()
            .filter(|band| band.activated_by(value))
            .max_by_key(|band| band.severity)
            .map(|band| (Level::from(band.severity), Some(band.direction)));

        let (to, direction) = match activated {
            Some(hit) if hit.0 > held.0 => hit,
            _ => held,
        };

        let reversed = from != Level::Normal && to != Level::Normal && direction != state.direction;
        let kind = match to.cmp(&from) {
            _ if reversed => TransitionKind::Up,
            std::cmp::Ordering::Greater => TransitionKind::Up,
            std::cmp::Ordering::Less => TransitionKind::Down,
            std::cmp::Ordering::Equal => TransitionKind::Steady,
        };

        state.level = to;
        state.direction = direction;

        let mut sustained_normal = false;
        if to == Level::Normal {
            if from != Level::Normal || state.normal_since.is_none() {
                state.normal_since = Some(reading.observed_at);
                state.closure_signalled = false;
            }
            let quiet = state
                .normal_since
                .is_some_and(|since| reading.observed_at - since >= self.quiet_period);
            if quiet && !state.closure_signalled {
                state.closure_signalled = true;
                sustained_normal = true;
            }
        } else {
            state.normal_since = None;
            state.closure_signalled = false;
        }

        if kind != TransitionKind::Steady {
            debug!(
                device_id = %reading.device_id,
                metric = %reading.metric,
                value,
                "Threshold level {:?} -> {:?}",
                from,
                to
            );
        }

        Evaluation {
            device_id: reading.device_id.clone(),
            metric: reading.metric,
            value,
            from,
            to,
            kind,
            direction,
            reversed,
            config_version: config.as_ref().map_or(0, |cfg| cfg.version),
            sustained_normal,
        }
    }

    /// Series that have sat in `normal` for the quiet period as of `now`
    /// without a closure signal yet (e.g. the device stopped reporting).
    /// Each series is reported once per normal stretch.
    pub fn quiet_series(&self, now: DateTime<Utc>) -> Vec<(String, Metric)> {
        // ---
        self.level_slots()
            .into_iter()
            .filter_map(|(key, slot)| {
                let mut state = slot.lock();
                let due = state.level == Level::Normal
                    && !state.closure_signalled
                    && state
                        .normal_since
                        .is_some_and(|since| now - since >= self.quiet_period);
                if due {
                    state.closure_signalled = true;
                    Some(key)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn levels(&self) -> Vec<SeriesLevelView> {
        // ---
        let mut views: Vec<SeriesLevelView> = self
            .level_slots()
            .into_iter()
            .map(|((device_id, metric), slot)| {
                let state = slot.lock();
                SeriesLevelView {
                    device_id,
                    metric,
                    level: state.level,
                    normal_since: state.normal_since,
                }
            })
            .collect();
        views.sort_by(|a, b| (&a.device_id, a.metric).cmp(&(&b.device_id, b.metric)));
        views
    }

    fn level_slots(&self) -> Vec<(LevelKey, Arc<Mutex<SeriesLevel>>)> {
        self.levels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Seed a series' level after a restart from the severity of its live
    /// threshold alert and the last reading the series reported.
    ///
    /// The level is whatever that severity's bands still hold for the
    /// reading; a reading already back inside every band starts the normal
    /// stretch at its observation time.
    pub fn restore_level(&self, reading: &Reading, severity: Severity) -> Level {
        // ---
        let config = self.config(reading.metric);
        let bands: &[Band] = config.as_deref().map_or(&[], |cfg| cfg.bands.as_slice());

        let (level, direction) = [Direction::Above, Direction::Below]
            .into_iter()
            .map(|side| held_level(bands, Level::from(severity), Some(side), reading.value))
            .max_by_key(|held| held.0)
            .unwrap_or((Level::Normal, None));

        let slot = self.slot(&(reading.device_id.clone(), reading.metric));
        let mut state = slot.lock();
        state.level = level;
        state.direction = direction;
        state.normal_since = (level == Level::Normal).then_some(reading.observed_at);
        state.closure_signalled = false;

        debug!(
            device_id = %reading.device_id,
            metric = %reading.metric,
            "Restored threshold level {:?}",
            level
        );
        level
    }
}

/// Highest level at or below `level`, in the triggering direction, whose
/// deactivation bound `value` has not crossed.
fn held_level(
    bands: &[Band],
    level: Level,
    direction: Option<Direction>,
    value: f64,
) -> (Level, Option<Direction>) {
    // ---
    let Some(direction) = direction else {
        return (Level::Normal, None);
    };

    bands
        .iter()
        .filter(|band| band.direction == direction && Level::from(band.severity) <= level)
        .filter(|band| band.held_by(value))
        .max_by_key(|band| band.severity)
        .map_or((Level::Normal, None), |band| {
            (Level::from(band.severity), Some(direction))
        })
}
