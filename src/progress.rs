use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smoothing factor of the throughput moving average.
pub const SMOOTHING_ALPHA: f64 = 0.3;

/// Throughput samples required before a time-remaining estimate is given.
const MIN_SAMPLES: u32 = 2;

/// Highest percentage reported before the end marker arrives.
const MAX_STREAMING_PERCENTAGE: f64 = 99.0;

/// Share of the estimated total at which the estimate is grown.
const REVISE_THRESHOLD: f64 = 0.9;

/// Growth applied to the bytes seen so far when revising the estimate.
const REVISE_FACTOR: f64 = 1.25;

/// Progress of one stream, as reported to subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamProgress {
    pub bytes_received: u64,
    /// Exponentially smoothed throughput.
    pub bytes_per_second: f64,
    /// 0-100, never decreasing within one stream.
    pub percentage: f64,
    /// `None` until enough samples exist.
    pub estimated_time_remaining_ms: Option<u64>,
}

/// Turns raw byte deltas into a smoothed progress signal.
///
/// The total output length is unknown until the end marker, so the
/// percentage is measured against a running estimate seeded from the source
/// length. The estimate grows when the stream overtakes it; the reported
/// percentage is clamped so it never moves backwards.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    estimated_total: f64,
    bytes_received: u64,
    smoothed_bps: Option<f64>,
    samples: u32,
    last_elapsed: Duration,
    reported_percentage: f64,
}

impl ProgressEstimator {
    /// `expected_bytes` seeds the total-length estimate (a rewrite is
    /// usually close to its source length).
    pub fn new(expected_bytes: usize) -> Self {
        Self {
            estimated_total: expected_bytes.max(1) as f64,
            bytes_received: 0,
            smoothed_bps: None,
            samples: 0,
            last_elapsed: Duration::ZERO,
            reported_percentage: 0.0,
        }
    }

    /// Record `delta_bytes` received at `elapsed` since the stream opened.
    pub fn record(&mut self, delta_bytes: usize, elapsed: Duration) -> StreamProgress {
        self.bytes_received += delta_bytes as u64;

        let dt = elapsed.saturating_sub(self.last_elapsed).as_secs_f64();
        if dt > 0.0 {
            let sample = delta_bytes as f64 / dt;
            self.smoothed_bps = Some(match self.smoothed_bps {
                Some(smoothed) => smoothed * (1.0 - SMOOTHING_ALPHA) + sample * SMOOTHING_ALPHA,
                None => sample,
            });
            self.samples += 1;
            self.last_elapsed = elapsed;
        }

        let received = self.bytes_received as f64;
        let guess = self.percentage_guess();
        if guess > 0.0 && received >= self.estimated_total * REVISE_THRESHOLD {
            // total = received / fraction, with the fraction pulled back so
            // the stream has room to continue.
            let fraction = (guess / 100.0).min(1.0 / REVISE_FACTOR);
            self.estimated_total = received / fraction;
        }

        let percentage = self.percentage_guess().min(MAX_STREAMING_PERCENTAGE);
        self.reported_percentage = self.reported_percentage.max(percentage);
        self.snapshot()
    }

    /// Final sample once the end marker has arrived.
    pub fn finish(&mut self) -> StreamProgress {
        self.estimated_total = self.bytes_received as f64;
        self.reported_percentage = 100.0;
        StreamProgress {
            estimated_time_remaining_ms: Some(0),
            ..self.snapshot()
        }
    }

    pub fn estimated_total(&self) -> f64 {
        self.estimated_total
    }

    fn percentage_guess(&self) -> f64 {
        (self.bytes_received as f64 / self.estimated_total * 100.0).clamp(0.0, 100.0)
    }

    fn time_remaining_ms(&self) -> Option<u64> {
        if self.samples < MIN_SAMPLES {
            return None;
        }
        let bps = self.smoothed_bps.filter(|bps| *bps > 0.0)?;
        let remaining = (self.estimated_total - self.bytes_received as f64).max(0.0);
        Some((remaining / bps * 1000.0).round() as u64)
    }

    fn snapshot(&self) -> StreamProgress {
        StreamProgress {
            bytes_received: self.bytes_received,
            bytes_per_second: self.smoothed_bps.unwrap_or(0.0),
            percentage: self.reported_percentage,
            estimated_time_remaining_ms: self.time_remaining_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_no_estimate_before_enough_samples() {
        let mut estimator = ProgressEstimator::new(1000);
        let first = estimator.record(100, ms(100));
        assert_eq!(first.bytes_received, 100);
        assert!(first.estimated_time_remaining_ms.is_none());

        let second = estimator.record(100, ms(200));
        assert!(second.estimated_time_remaining_ms.is_some());
    }

    #[test]
    fn test_exponential_smoothing() {
        let mut estimator = ProgressEstimator::new(10_000);
        // 1000 B/s, then 2000 B/s: 1000 * 0.7 + 2000 * 0.3 = 1300
        estimator.record(100, ms(100));
        let progress = estimator.record(200, ms(200));
        assert!((progress.bytes_per_second - 1300.0).abs() < 1e-6);
    }

    #[test]
    fn test_time_remaining_from_smoothed_rate() {
        let mut estimator = ProgressEstimator::new(1000);
        estimator.record(100, ms(100));
        let progress = estimator.record(100, ms(200));
        // 800 bytes left at 1000 B/s
        assert_eq!(progress.estimated_time_remaining_ms, Some(800));
        assert!((progress.percentage - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_elapsed_sample_does_not_divide_by_zero() {
        let mut estimator = ProgressEstimator::new(100);
        let progress = estimator.record(10, Duration::ZERO);
        assert_eq!(progress.bytes_per_second, 0.0);
        assert!(progress.estimated_time_remaining_ms.is_none());
    }

    #[test]
    fn test_estimate_grows_when_stream_overtakes_it() {
        let mut estimator = ProgressEstimator::new(100);
        let mut last = 0.0;
        for i in 1..=50 {
            let progress = estimator.record(10, ms(i * 10));
            assert!(progress.percentage >= last);
            assert!(progress.percentage <= MAX_STREAMING_PERCENTAGE);
            last = progress.percentage;
        }
        assert!(estimator.estimated_total() > 500.0);
    }

    #[test]
    fn test_finish_reports_one_hundred() {
        let mut estimator = ProgressEstimator::new(1000);
        estimator.record(10, ms(10));
        let done = estimator.finish();
        assert_eq!(done.percentage, 100.0);
        assert_eq!(done.estimated_time_remaining_ms, Some(0));
        assert_eq!(done.bytes_received, 10);
    }

    #[test]
    fn test_empty_source_does_not_panic() {
        let mut estimator = ProgressEstimator::new(0);
        let progress = estimator.record(5, ms(5));
        assert!(progress.percentage <= MAX_STREAMING_PERCENTAGE);
    }
}
