use std::collections::VecDeque;

/// Rolling window over the wall-clock interval between consecutive blocks.
#[derive(Debug, Clone)]
pub struct TimingStats {
    intervals_ms: VecDeque<f64>,
    capacity: usize,
}

impl TimingStats {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            intervals_ms: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an interval, evicting the oldest one once the window is full.
    pub fn push(&mut self, interval_ms: f64) {
        if self.intervals_ms.len() == self.capacity {
            self.intervals_ms.pop_front();
        }
        self.intervals_ms.push_back(interval_ms);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.intervals_ms.is_empty() {
            return None;
        }
        Some(self.intervals_ms.iter().sum::<f64>() / self.intervals_ms.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.intervals_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals_ms.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Instantaneous sampling rate (Hz) of a block spanning `first_ms..=last_ms`.
///
/// Returns `None` for a block without a time span.
pub fn estimate_frequency(block_size: usize, first_ms: f64, last_ms: f64) -> Option<f64> {
    let span = last_ms - first_ms;
    if span <= 0.0 {
        return None;
    }
    Some(1000.0 * block_size as f64 / span)
}
