//! Box-plot summary statistics.
//!
//! Percentiles use linear interpolation between closest ranks, so the
//! median of an even-length sequence is the mean of the two middle values.

use serde::{Deserialize, Serialize};

/// Summary of a run of samples.
///
/// `median`, `q1` and `q3` are only filled for quantities that keep
/// box-plot statistics; bulk quantities carry the count alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Summary {
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q3: Option<f64>,
}

impl Summary {
    /// Count-only summary used for bulk quantities.
    pub fn count_only(count: usize) -> Self {
        Self { count, ..Default::default() }
    }

    /// Full box-plot summary over `values`.
    pub fn box_plot(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = sorted.iter().sum();

        Self {
            count: sorted.len(),
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            mean: Some(sum / sorted.len() as f64),
            median: Some(percentile(&sorted, 0.5)),
            q1: Some(percentile(&sorted, 0.25)),
            q3: Some(percentile(&sorted, 0.75)),
        }
    }
}

/// Running min/max/sum/count, folded incrementally as samples are analyzed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Running {
    pub count: usize,
    pub sum: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Running {
    pub fn fold(&mut self, values: &[f64]) {
        for &v in values {
            self.count += 1;
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Combines per-slice aggregates; the mean of the result is weighted by
    /// each part's sample count.
    pub fn merge<'a>(parts: impl IntoIterator<Item = &'a Running>) -> Running {
        let mut out = Running::default();
        for part in parts {
            if part.count == 0 {
                continue;
            }
            out.count += part.count;
            out.sum += part.sum;
            out.min = match (out.min, part.min) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            out.max = match (out.max, part.max) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        out
    }
}

/// Percentile of an ascending, non-empty slice, `q` in `[0, 1]`.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_plot_odd() {
        let s = Summary::box_plot(&[5.0, 1.0, 3.0, 2.0, 4.0]);
        assert_eq!(s.count, 5);
        assert_eq!(s.min, Some(1.0));
        assert_eq!(s.max, Some(5.0));
        assert_eq!(s.median, Some(3.0));
        assert_eq!(s.q1, Some(2.0));
        assert_eq!(s.q3, Some(4.0));
        assert_eq!(s.mean, Some(3.0));
    }

    #[test]
    fn test_box_plot_even_median() {
        let s = Summary::box_plot(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.median, Some(2.5));
        assert_eq!(s.q1, Some(1.75));
    }

    #[test]
    fn test_empty_summary() {
        let s = Summary::box_plot(&[]);
        assert_eq!(s.count, 0);
        assert!(s.mean.is_none());
    }

    #[test]
    fn test_weighted_merge() {
        let mut a = Running::default();
        a.fold(&[10.0; 3]);
        let mut b = Running::default();
        b.fold(&[20.0]);
        let merged = Running::merge([&a, &b, &Running::default()]);
        assert_eq!(merged.count, 4);
        assert_eq!(merged.mean(), Some(12.5));
        assert_eq!(merged.min, Some(10.0));
        assert_eq!(merged.max, Some(20.0));
    }
}
