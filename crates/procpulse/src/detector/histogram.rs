//! Per-window distribution of lag samples
//!
//! Reading the histogram is destructive: [`LagHistogram::read`] returns the
//! window's statistics, clears the samples and leaves the histogram
//! disarmed. Samples offered while disarmed are dropped until
//! [`LagHistogram::rearm`] is called.
//!
//! A window keeps at most `max_samples` samples for percentiles. Samples
//! past the cap are counted as dropped but still add to the stalled time.

use crate::error::{Error, Result};
use serde::Serialize;

/// Default per-window sample cap
pub const DEFAULT_MAX_SAMPLES: usize = 65_536;

/// Collection state of a [`LagHistogram`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramState {
    Armed,
    Disarmed,
}

/// Lag statistics for one reporting window, all in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LagSnapshot {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    /// Sum of the positive samples: time the scheduler could not service
    /// the sampling timer
    pub stalled: f64,
}

/// Histogram of lag samples with an armed/disarmed read protocol
#[derive(Debug)]
pub struct LagHistogram {
    samples: Vec<f64>,
    max_samples: usize,
    stalled: f64,
    state: HistogramState,
    dropped: u64,
}

impl Default for LagHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LagHistogram {
    /// Create an armed, empty histogram
    pub fn new() -> Self {
        Self::with_max_samples(DEFAULT_MAX_SAMPLES)
    }

    /// Create an armed histogram keeping at most `max_samples` per window
    pub fn with_max_samples(max_samples: usize) -> Self {
        Self {
            samples: Vec::new(),
            max_samples: max_samples.max(1),
            stalled: 0.0,
            state: HistogramState::Armed,
            dropped: 0,
        }
    }

    pub fn state(&self) -> HistogramState {
        self.state
    }

    /// Samples not kept since creation, offered while disarmed or past the
    /// per-window cap
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Record one lag sample in milliseconds
    pub fn record(&mut self, lag_ms: f64) {
        if self.state == HistogramState::Disarmed {
            self.dropped += 1;
            return;
        }

        if lag_ms > 0.0 {
            self.stalled += lag_ms;
        }
        if self.samples.len() < self.max_samples {
            self.samples.push(lag_ms);
        } else {
            self.dropped += 1;
        }
    }

    /// Take the window's statistics and disarm
    pub fn read(&mut self) -> Result<LagSnapshot> {
        if self.state == HistogramState::Disarmed {
            return Err(Error::HistogramDisarmed);
        }
        self.state = HistogramState::Disarmed;

        let mut samples = std::mem::take(&mut self.samples);
        let stalled = std::mem::take(&mut self.stalled);
        Ok(LagSnapshot {
            stalled,
            ..summarize(&mut samples)
        })
    }

    /// Resume collection after a read
    pub fn rearm(&mut self) {
        self.state = HistogramState::Armed;
    }
}

fn summarize(samples: &mut [f64]) -> LagSnapshot {
    if samples.is_empty() {
        return LagSnapshot::default();
    }

    samples.sort_by(|a, b| a.total_cmp(b));

    let count = samples.len();
    let sum: f64 = samples.iter().sum();

    LagSnapshot {
        count: count as u64,
        min: samples[0],
        max: samples[count - 1],
        mean: sum / count as f64,
        p50: nearest_rank(samples, 50.0),
        p90: nearest_rank(samples, 90.0),
        p99: nearest_rank(samples, 99.0),
        stalled: 0.0,
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_read_reports_zeros() {
        let mut histogram = LagHistogram::new();
        let snapshot = histogram.read().unwrap();
        assert_eq!(snapshot, LagSnapshot::default());
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let mut histogram = LagHistogram::new();
        for lag in 1..=100 {
            histogram.record(lag as f64);
        }

        let snapshot = histogram.read().unwrap();
        assert_eq!(snapshot.count, 100);
        assert_eq!(snapshot.min, 1.0);
        assert_eq!(snapshot.max, 100.0);
        assert_eq!(snapshot.mean, 50.5);
        assert_eq!(snapshot.p50, 50.0);
        assert_eq!(snapshot.p90, 90.0);
        assert_eq!(snapshot.p99, 99.0);
    }

    #[test]
    fn test_stalled_only_counts_positive_lag() {
        let mut histogram = LagHistogram::new();
        histogram.record(-2.0);
        histogram.record(0.0);
        histogram.record(5.0);
        histogram.record(1500.0);

        let snapshot = histogram.read().unwrap();
        assert_eq!(snapshot.stalled, 1505.0);
        assert_eq!(snapshot.min, -2.0);
        assert_eq!(snapshot.mean, 375.75);
    }

    #[test]
    fn test_read_disarms_until_rearmed() {
        let mut histogram = LagHistogram::new();
        histogram.record(3.0);
        histogram.read().unwrap();

        assert_eq!(histogram.state(), HistogramState::Disarmed);
        assert!(matches!(histogram.read(), Err(Error::HistogramDisarmed)));

        histogram.record(7.0);
        assert_eq!(histogram.dropped(), 1);

        histogram.rearm();
        histogram.record(9.0);
        let snapshot = histogram.read().unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.max, 9.0);
    }

    #[test]
    fn test_window_is_capped() {
        let mut histogram = LagHistogram::with_max_samples(3);
        for lag in [1.0, 2.0, 3.0, 400.0, 500.0] {
            histogram.record(lag);
        }
        assert_eq!(histogram.dropped(), 2);

        let snapshot = histogram.read().unwrap();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.max, 3.0);
        // Stalled time covers every sample, kept or not
        assert_eq!(snapshot.stalled, 906.0);

        histogram.rearm();
        histogram.record(7.0);
        let snapshot = histogram.read().unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.stalled, 7.0);
    }

    #[test]
    fn test_read_clears_window() {
        let mut histogram = LagHistogram::new();
        histogram.record(10.0);
        histogram.read().unwrap();
        histogram.rearm();

        assert_eq!(histogram.read().unwrap().count, 0);
    }
}
