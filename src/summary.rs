//! Calendar-day rollups built from the fleet day buckets and the alert
//! history.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::aggregation::BucketAggregate;
use crate::models::{Alert, Granularity, Metric, Severity};

// ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMetricStats {
    pub reading_count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// One UTC day of fleet activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub reading_count: u64,
    pub metrics: BTreeMap<Metric, DailyMetricStats>,
    /// Alerts first triggered on this day, archived ones included.
    pub alert_count: usize,
    pub critical_alert_count: usize,
}

impl DailySummary {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            reading_count: 0,
            metrics: BTreeMap::new(),
            alert_count: 0,
            critical_alert_count: 0,
        }
    }
}

/// Summaries for every day in `[from, to]` that saw readings or alerts,
/// oldest first. Buckets other than day buckets are ignored.
pub fn summarize_days(
    from: NaiveDate,
    to: NaiveDate,
    buckets: &[BucketAggregate],
    alerts: &[Alert],
) -> Vec<DailySummary> {
    // ---
    let in_range = |date: NaiveDate| from <= date && date <= to;
    let mut days: BTreeMap<NaiveDate, DailySummary> = BTreeMap::new();

    for bucket in buckets
        .iter()
        .filter(|b| b.granularity == Granularity::Day && b.count > 0)
    {
        let date = bucket.bucket_start.date_naive();
        if !in_range(date) {
            continue;
        }
        let day = days
            .entry(date)
            .or_insert_with(|| DailySummary::empty(date));
        day.reading_count += bucket.count;
        day.metrics.insert(
            bucket.metric,
            DailyMetricStats {
                reading_count: bucket.count,
                mean: bucket.mean,
                min: bucket.min,
                max: bucket.max,
            },
        );
    }

    for alert in alerts {
        let date = alert.triggered_at.date_naive();
        if !in_range(date) {
            continue;
        }
        let day = days
            .entry(date)
            .or_insert_with(|| DailySummary::empty(date));
        day.alert_count += 1;
        if alert.severity == Severity::Critical {
            day.critical_alert_count += 1;
        }
    }

    days.into_values().collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{AlertOrigin, AlertState};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn day_bucket(metric: Metric, day: u32, count: u64, mean: f64) -> BucketAggregate {
        BucketAggregate {
            metric,
            granularity: Granularity::Day,
            bucket_start: at(day, 0),
            count,
            sum: mean * count as f64,
            mean,
            min: mean - 1.0,
            max: mean + 1.0,
            finalized: false,
            late_revisions: 0,
        }
    }

    fn alert(severity: Severity, triggered_at: DateTime<Utc>) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            device_id: "s1".to_string(),
            metric: Metric::Methane,
            origins: BTreeSet::from([AlertOrigin::Threshold]),
            severity,
            state: AlertState::AutoClosed,
            triggered_at,
            last_seen_at: triggered_at,
            state_changed_at: triggered_at,
            acknowledged_at: None,
            closed_at: Some(triggered_at),
            last_notified_at: None,
            archived_at: Some(triggered_at),
            trigger_count: 1,
            message: "methane high".to_string(),
        }
    }

    #[test]
    fn test_days_combine_buckets_and_alerts() {
        // ---
        let buckets = vec![
            day_bucket(Metric::Methane, 1, 10, 120.0),
            day_bucket(Metric::Humidity, 1, 5, 55.0),
            day_bucket(Metric::Methane, 3, 2, 80.0),
        ];
        let alerts = vec![
            alert(Severity::Critical, at(1, 9)),
            alert(Severity::Warning, at(1, 23)),
            alert(Severity::Warning, at(2, 4)),
        ];

        let days = summarize_days(date(1), date(3), &buckets, &alerts);
        assert_eq!(days.iter().map(|d| d.date).collect::<Vec<_>>(), vec![date(1), date(2), date(3)]);

        let first = &days[0];
        assert_eq!(first.reading_count, 15);
        assert_eq!(first.metrics[&Metric::Humidity].mean, 55.0);
        assert_eq!(first.alert_count, 2);
        assert_eq!(first.critical_alert_count, 1);

        // A day with alerts but no readings still shows up.
        assert_eq!(days[1].reading_count, 0);
        assert!(days[1].metrics.is_empty());
        assert_eq!(days[1].alert_count, 1);

        assert_eq!(days[2].alert_count, 0);
    }

    #[test]
    fn test_days_outside_range_and_other_granularities_are_skipped() {
        // ---
        let mut hourly = day_bucket(Metric::Methane, 2, 4, 100.0);
        hourly.granularity = Granularity::Hour;
        let buckets = vec![day_bucket(Metric::Methane, 1, 3, 90.0), hourly];
        let alerts = vec![alert(Severity::Critical, at(4, 1))];

        assert!(summarize_days(date(2), date(3), &buckets, &alerts).is_empty());
    }
}
