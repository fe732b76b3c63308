//! Read-only analysis over captured rows: zoom-window means and value distribution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::buffer::SampleRow;
use crate::errors::UnknownBinRule;

/// Upper bound on the number of histogram bins, whatever the rule asks for.
pub const MAX_BINS: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Column {
    Time,
    /// Power (mW) or current (mA), depending on the capture mode.
    Value,
    Vbat,
}

impl Column {
    pub fn get(self, row: &SampleRow) -> f64 {
        match self {
            Column::Time => row.time_ms,
            Column::Value => row.value,
            Column::Vbat => row.vbat_mv,
        }
    }
}

pub fn column(rows: &[SampleRow], column: Column) -> Vec<f64> {
    rows.iter().map(|r| column.get(r)).collect()
}

/// Mean of `column` over rows with `min_ms <= time < max_ms`.
///
/// Rows must be sorted by time, as a capture buffer is. `None` when the window is empty.
pub fn window_mean(rows: &[SampleRow], min_ms: f64, max_ms: f64, column: Column) -> Option<f64> {
    let start = rows.partition_point(|r| r.time_ms < min_ms);
    let end = rows.partition_point(|r| r.time_ms < max_ms).max(start);
    let window = &rows[start..end];
    if window.is_empty() {
        return None;
    }
    Some(window.iter().map(|r| column.get(r)).sum::<f64>() / window.len() as f64)
}

/// Bin-width estimators for [`histogram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BinRule {
    /// Smaller of `Fd` and `Sturges`; `Sturges` when the IQR is zero.
    #[default]
    Auto,
    /// Freedman-Diaconis: `2 * IQR / n^(1/3)`.
    Fd,
    Doane,
    Scott,
    Rice,
    Sturges,
    Sqrt,
}

impl BinRule {
    pub const ALL: [BinRule; 7] = [
        BinRule::Auto,
        BinRule::Fd,
        BinRule::Doane,
        BinRule::Scott,
        BinRule::Rice,
        BinRule::Sturges,
        BinRule::Sqrt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BinRule::Auto => "auto",
            BinRule::Fd => "fd",
            BinRule::Doane => "doane",
            BinRule::Scott => "scott",
            BinRule::Rice => "rice",
            BinRule::Sturges => "sturges",
            BinRule::Sqrt => "sqrt",
        }
    }

    /// Bin width for `values`; 0 means "use a single bin".
    fn width(self, values: &[f64], ptp: f64) -> f64 {
        let n = values.len() as f64;
        match self {
            BinRule::Sqrt => ptp / n.sqrt(),
            BinRule::Sturges => ptp / (n.log2() + 1.0),
            BinRule::Rice => ptp / (2.0 * n.powf(1.0 / 3.0)),
            BinRule::Scott => {
                let factor = (24.0 * std::f64::consts::PI.sqrt() / n).powf(1.0 / 3.0);
                factor * std_dev(values)
            }
            BinRule::Fd => {
                let iqr = percentile(values, 75.0) - percentile(values, 25.0);
                2.0 * iqr * n.powf(-1.0 / 3.0)
            }
            BinRule::Doane => {
                if values.len() <= 2 {
                    return 0.0;
                }
                let sg1 = (6.0 * (n - 2.0) / ((n + 1.0) * (n + 3.0))).sqrt();
                let sigma = std_dev(values);
                if sigma <= 0.0 {
                    return 0.0;
                }
                let m = mean(values);
                let g1 = values.iter().map(|v| ((v - m) / sigma).powi(3)).sum::<f64>() / n;
                ptp / (1.0 + n.log2() + (1.0 + g1.abs() / sg1).log2())
            }
            BinRule::Auto => {
                let fd = BinRule::Fd.width(values, ptp);
                let sturges = BinRule::Sturges.width(values, ptp);
                if fd > 0.0 {
                    fd.min(sturges)
                } else {
                    sturges
                }
            }
        }
    }
}

impl fmt::Display for BinRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BinRule {
    type Err = UnknownBinRule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BinRule::ALL
            .into_iter()
            .find(|rule| rule.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownBinRule(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    /// `counts.len() + 1` ascending edges; the last bin includes its right edge.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Equal-width histogram of the finite `values`, bin count chosen by `rule`.
pub fn histogram(values: &[f64], rule: BinRule) -> Histogram {
    let values: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Histogram {
            edges: vec![0.0, 1.0],
            counts: vec![0],
        };
    }

    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let ptp = hi - lo;
    let (first, last) = if ptp == 0.0 { (lo - 0.5, hi + 0.5) } else { (lo, hi) };

    let width = rule.width(&values, ptp);
    let bins = if width > 0.0 {
        (((last - first) / width).ceil() as usize).clamp(1, MAX_BINS)
    } else {
        1
    };

    let step = (last - first) / bins as f64;
    let mut edges: Vec<f64> = (0..=bins).map(|i| first + i as f64 * step).collect();
    edges[bins] = last;

    let mut counts = vec![0usize; bins];
    let norm = bins as f64 / (last - first);
    for &v in &values {
        let mut idx = (((v - first) * norm) as usize).min(bins - 1);
        // the float index can land one bin off near an edge
        if v < edges[idx] && idx > 0 {
            idx -= 1;
        } else if idx + 1 < bins && v >= edges[idx + 1] {
            idx += 1;
        }
        counts[idx] += 1;
    }
    Histogram { edges, counts }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn std_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Linearly interpolated percentile, `q` in 0..=100.
fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let below = pos.floor() as usize;
    let above = pos.ceil() as usize;
    sorted[below] + (sorted[above] - sorted[below]) * (pos - below as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Vec<SampleRow> {
        (0..n)
            .map(|i| SampleRow::new(i as f64 * 2.5, i as f64, 3700.0 + i as f64))
            .collect()
    }

    #[test]
    fn window_mean_is_half_open() {
        let rows = rows(10);
        // times 5.0, 7.5, 10.0 -> values 2, 3, 4
        assert_eq!(window_mean(&rows, 5.0, 12.5, Column::Value), Some(3.0));
        assert_eq!(window_mean(&rows, 5.0, 12.5, Column::Vbat), Some(3703.0));
        assert_eq!(window_mean(&rows, 4.0, 5.0, Column::Value), None);
        assert_eq!(window_mean(&rows, 30.0, 10.0, Column::Value), None);
        assert_eq!(window_mean(&[], 0.0, 1.0, Column::Value), None);
    }

    #[test]
    fn column_extracts_one_field() {
        let rows = rows(3);
        assert_eq!(column(&rows, Column::Time), vec![0.0, 2.5, 5.0]);
        assert_eq!(column(&rows, Column::Vbat), vec![3700.0, 3701.0, 3702.0]);
    }

    #[test]
    fn sqrt_rule_on_uniform_values() {
        let values: Vec<f64> = (0..16).map(f64::from).collect();
        let h = histogram(&values, BinRule::Sqrt);
        assert_eq!(h.bins(), 4);
        assert_eq!(h.counts, vec![4, 4, 4, 4]);
        assert_eq!(h.edges.first(), Some(&0.0));
        assert_eq!(h.edges.last(), Some(&15.0));
    }

    #[test]
    fn sturges_bins() {
        let values: Vec<f64> = (0..16).map(f64::from).collect();
        let h = histogram(&values, BinRule::Sturges);
        assert_eq!(h.bins(), 5);
        assert_eq!(h.total(), 16);
    }

    #[test]
    fn constant_values_use_one_bin() {
        for rule in BinRule::ALL {
            let h = histogram(&[2.0; 8], rule);
            assert_eq!(h.counts, vec![8], "{rule}");
            assert_eq!(h.edges, vec![1.5, 2.5]);
        }
    }

    #[test]
    fn every_rule_counts_every_value() {
        let values: Vec<f64> = (0..200).map(|i| ((i * 37) % 101) as f64 * 0.3).collect();
        for rule in BinRule::ALL {
            let h = histogram(&values, rule);
            assert_eq!(h.total(), values.len(), "{rule}");
            assert_eq!(h.edges.len(), h.bins() + 1);
        }
        let auto = histogram(&values, BinRule::Auto).bins();
        assert!(auto >= histogram(&values, BinRule::Sturges).bins());
    }

    #[test]
    fn empty_and_non_finite_input() {
        let h = histogram(&[f64::NAN, f64::INFINITY], BinRule::Auto);
        assert_eq!(h.counts, vec![0]);
    }

    #[test]
    fn rule_names_round_trip() {
        for rule in BinRule::ALL {
            assert_eq!(rule.name().parse::<BinRule>().unwrap(), rule);
        }
        assert_eq!("FD".parse::<BinRule>().unwrap(), BinRule::Fd);
        assert!("bogus".parse::<BinRule>().is_err());
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[4.0, 1.0, 3.0, 2.0], 50.0), 2.5);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 25.0), 2.0);
    }
}
