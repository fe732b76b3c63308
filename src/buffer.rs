//! Per-device growing time series.

use serde::{Deserialize, Serialize};

/// One captured sample: time (ms), power (mW) or current (mA), battery voltage (mV).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleRow {
    pub time_ms: f64,
    pub value: f64,
    pub vbat_mv: f64,
}

impl SampleRow {
    pub fn new(time_ms: f64, value: f64, vbat_mv: f64) -> Self {
        Self {
            time_ms,
            value,
            vbat_mv,
        }
    }
}

/// Append-only series of [`SampleRow`]s, plus the relative-time origin of the capture.
///
/// Shared between the acquisition loop (writer) and consumers (snapshot) behind a mutex;
/// it carries no locking of its own.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    rows: Vec<SampleRow>,
    origin_ns: Option<i64>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, rows: &[SampleRow]) {
        self.rows.extend_from_slice(rows);
    }

    /// Independent copy of every row.
    pub fn snapshot(&self) -> Vec<SampleRow> {
        self.rows.clone()
    }

    /// Drop every row and forget the relative-time origin.
    pub fn reset(&mut self) {
        self.rows = Vec::new();
        self.origin_ns = None;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first_time(&self) -> Option<f64> {
        self.rows.first().map(|r| r.time_ms)
    }

    pub fn last_time(&self) -> Option<f64> {
        self.rows.last().map(|r| r.time_ms)
    }

    pub fn origin_ns(&self) -> Option<i64> {
        self.origin_ns
    }

    /// The relative-time origin, taking `first_ns` if none was recorded since the last reset.
    pub fn origin_or_insert(&mut self, first_ns: i64) -> i64 {
        *self.origin_ns.get_or_insert(first_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(start: f64, n: usize) -> Vec<SampleRow> {
        (0..n)
            .map(|i| SampleRow::new(start + i as f64, i as f64 * 2.0, 3700.0))
            .collect()
    }

    #[test]
    fn append_is_associative() {
        let a = rows(0.0, 4);
        let b = rows(4.0, 3);

        let mut split = SampleBuffer::new();
        split.append(&a);
        split.append(&b);

        let mut joined = SampleBuffer::new();
        joined.append(&[a, b].concat());

        assert_eq!(split.snapshot(), joined.snapshot());
        assert_eq!(split.len(), 7);
    }

    #[test]
    fn snapshot_is_independent() {
        let mut buf = SampleBuffer::new();
        buf.append(&rows(0.0, 3));
        let snap = buf.snapshot();

        buf.append(&rows(3.0, 3));
        buf.reset();

        assert_eq!(snap.len(), 3);
        assert_eq!(snap[2].time_ms, 2.0);
        assert!(buf.is_empty());
    }

    #[test]
    fn reset_clears_origin() {
        let mut buf = SampleBuffer::new();
        assert_eq!(buf.origin_or_insert(500), 500);
        assert_eq!(buf.origin_or_insert(900), 500);
        buf.append(&rows(0.0, 2));

        buf.reset();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.origin_ns(), None);
        assert_eq!(buf.origin_or_insert(900), 900);
    }

    #[test]
    fn first_and_last_time() {
        let mut buf = SampleBuffer::new();
        assert_eq!(buf.last_time(), None);
        buf.append(&rows(10.0, 5));
        assert_eq!(buf.first_time(), Some(10.0));
        assert_eq!(buf.last_time(), Some(14.0));
    }
}
