//! Correlation Module: pairwise Pearson coefficients between device series.
//!
//! Series are aligned on the minute means the Aggregation Engine keeps. Only
//! minutes present in both series count as overlap; pairs with too little
//! overlap, or with a flat series, are reported as undefined (`None`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::SeriesId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationMatrix {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub series: Vec<SeriesId>,
    /// `coefficients[i][j]` relates `series[i]` and `series[j]`.
    pub coefficients: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &SeriesId, b: &SeriesId) -> Option<f64> {
        // ---
        let i = self.series.iter().position(|s| s == a)?;
        let j = self.series.iter().position(|s| s == b)?;
        self.coefficients[i][j]
    }
}

/// Pearson correlation of two equally long samples. `None` when either
/// sample has no variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    // ---
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }

    let mean_x = xs[..n].iter().sum::<f64>() / n as f64;
    let mean_y = ys[..n].iter().sum::<f64>() / n as f64;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in xs[..n].iter().zip(&ys[..n]) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }

    if sxx <= f64::EPSILON || syy <= f64::EPSILON {
        return None;
    }
    Some((sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0))
}

fn aligned(
    a: &BTreeMap<DateTime<Utc>, f64>,
    b: &BTreeMap<DateTime<Utc>, f64>,
) -> (Vec<f64>, Vec<f64>) {
    a.iter()
        .filter_map(|(minute, x)| b.get(minute).map(|y| (*x, *y)))
        .unzip()
}

pub fn compute_correlations(
    series: &[(SeriesId, BTreeMap<DateTime<Utc>, f64>)],
    min_overlap: usize,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> CorrelationMatrix {
    // ---
    let n = series.len();
    let mut coefficients = vec![vec![None; n]; n];
    let min_overlap = min_overlap.max(2);

    for i in 0..n {
        for j in i..n {
            let (xs, ys) = aligned(&series[i].1, &series[j].1);
            if xs.len() < min_overlap {
                continue;
            }
            let r = pearson(&xs, &ys).map(|r| if i == j { 1.0 } else { r });
            coefficients[i][j] = r;
            coefficients[j][i] = r;
        }
    }

    CorrelationMatrix {
        window_start,
        window_end,
        series: series.iter().map(|(id, _)| id.clone()).collect(),
        coefficients,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Metric;
    use chrono::{Duration, TimeZone};

    fn minutes(values: &[(i64, f64)]) -> BTreeMap<DateTime<Utc>, f64> {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .map(|(m, v)| (t0 + Duration::minutes(*m), *v))
            .collect()
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        (t0, t0 + Duration::hours(1))
    }

    #[test]
    fn test_pearson_perfect_relationships() {
        // ---
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let up = [2.0, 4.0, 6.0, 8.0, 10.0];
        let down = [10.0, 8.0, 6.0, 4.0, 2.0];

        assert!((pearson(&xs, &up).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&xs, &down).unwrap() + 1.0).abs() < 1e-12);
        assert!(pearson(&xs, &[3.0; 5]).is_none());
    }

    #[test]
    fn test_self_correlation_is_one() {
        // ---
        let temp = SeriesId::device("s1", Metric::Temperature);
        let data: Vec<(i64, f64)> = (0..20).map(|m| (m, 20.0 + (m as f64).sin())).collect();
        let (start, end) = window();

        let matrix = compute_correlations(&[(temp.clone(), minutes(&data))], 10, start, end);
        assert_eq!(matrix.get(&temp, &temp), Some(1.0));
    }

    #[test]
    fn test_insufficient_overlap_is_undefined() {
        // ---
        let temp = SeriesId::device("s1", Metric::Temperature);
        let hum = SeriesId::device("s1", Metric::Humidity);
        let a: Vec<(i64, f64)> = (0..20).map(|m| (m, 20.0 + m as f64)).collect();
        // Only 5 shared minutes.
        let b: Vec<(i64, f64)> = (15..40).map(|m| (m, 80.0 - m as f64)).collect();
        let (start, end) = window();

        let matrix = compute_correlations(
            &[(temp.clone(), minutes(&a)), (hum.clone(), minutes(&b))],
            10,
            start,
            end,
        );

        assert_eq!(matrix.get(&temp, &hum), None);
        assert_eq!(matrix.get(&hum, &temp), None);
        assert_eq!(matrix.get(&temp, &temp), Some(1.0));
    }

    #[test]
    fn test_inverse_series_correlate_negatively() {
        // ---
        let temp = SeriesId::device("s1", Metric::Temperature);
        let hum = SeriesId::device("s1", Metric::Humidity);
        let a: Vec<(i64, f64)> = (0..30).map(|m| (m, 20.0 + 0.1 * m as f64)).collect();
        let b: Vec<(i64, f64)> = (0..30).map(|m| (m, 70.0 - 0.3 * m as f64)).collect();
        let (start, end) = window();

        let matrix = compute_correlations(
            &[(temp.clone(), minutes(&a)), (hum.clone(), minutes(&b))],
            10,
            start,
            end,
        );

        let r = matrix.get(&temp, &hum).unwrap();
        assert!((r + 1.0).abs() < 1e-9, "expected -1, got {r}");
    }
}
