//! Anomaly Detector: z-score of a reading against its series' rolling
//! statistics, independent of any configured threshold.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregation::StatsSnapshot;
use crate::config::AnomalyConfig;
use crate::models::{Metric, Reading, Severity};

/// Below this standard deviation a series is treated as flat and not scored.
const MIN_STDDEV: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalySignal {
    pub device_id: String,
    pub metric: Metric,
    pub value: f64,
    pub z_score: f64,
    pub mean: f64,
    pub stddev: f64,
    pub severity: Severity,
    pub observed_at: DateTime<Utc>,
}

impl AnomalySignal {
    pub fn message(&self) -> String {
        format!(
            "ANOMALY: {} reading {} deviates from rolling mean {:.2} (z={:.2})",
            self.metric.label(),
            self.metric.format_value(self.value),
            self.mean,
            self.z_score
        )
    }
}

pub struct AnomalyDetector {
    cfg: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(cfg: AnomalyConfig) -> Self {
        Self { cfg }
    }

    /// Score `reading` against `stats` (the series baseline before this
    /// reading). Cold-start series below `min_samples` never signal.
    pub fn check(&self, reading: &Reading, stats: &StatsSnapshot) -> Option<AnomalySignal> {
        // ---
        if stats.count < self.cfg.min_samples || stats.stddev < MIN_STDDEV {
            return None;
        }

        let z = (reading.value - stats.mean) / stats.stddev;
        if z.abs() <= self.cfg.z_bound {
            return None;
        }

        let severity = if z.abs() >= self.cfg.z_bound * 2.0 {
            Severity::Critical
        } else {
            Severity::Warning
        };

        Some(AnomalySignal {
            device_id: reading.device_id.clone(),
            metric: reading.metric,
            value: reading.value,
            z_score: z,
            mean: stats.mean,
            stddev: stats.stddev,
            severity,
            observed_at: reading.observed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn reading(value: f64) -> Reading {
        let at = Utc::now();
        Reading {
            device_id: "s1".to_string(),
            metric: Metric::Temperature,
            value,
            observed_at: at,
            received_at: at,
        }
    }

    fn stats(count: u64, mean: f64, stddev: f64) -> StatsSnapshot {
        StatsSnapshot {
            count,
            mean,
            variance: stddev * stddev,
            stddev,
            min: Some(mean - stddev),
            max: Some(mean + stddev),
        }
    }

    #[test]
    fn test_flags_large_deviation() {
        // ---
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let signal = detector.check(&reading(32.0), &stats(100, 24.0, 2.0)).unwrap();

        assert_eq!(signal.z_score, 4.0);
        assert_eq!(signal.severity, Severity::Warning);
        assert_eq!(
            signal.message(),
            "ANOMALY: Temperature reading 32°C deviates from rolling mean 24.00 (z=4.00)"
        );
    }

    #[test]
    fn test_extreme_deviation_is_critical() {
        // ---
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let signal = detector.check(&reading(10.0), &stats(100, 24.0, 2.0)).unwrap();

        assert_eq!(signal.z_score, -7.0);
        assert_eq!(signal.severity, Severity::Critical);
    }

    #[test]
    fn test_within_bound_is_quiet() {
        // ---
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        assert!(detector.check(&reading(29.0), &stats(100, 24.0, 2.0)).is_none());
    }

    #[test]
    fn test_cold_start_never_signals() {
        // ---
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        assert!(detector.check(&reading(59.0), &stats(5, 24.0, 0.5)).is_none());
        assert!(detector.check(&reading(59.0), &stats(500, 24.0, 0.0)).is_none());
    }
}
