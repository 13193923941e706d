//! Bandwidth estimation from completed segment fetches
//!
//! Two EWMAs smooth the raw samples: a fast one that reacts to change and a
//! slow one that remembers the sustained rate. The published estimate is the
//! minimum of the two, so a transient burst cannot talk the ABR engine into
//! a level the link cannot sustain.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// One throughput observation
#[derive(Debug, Clone, Copy)]
pub struct BandwidthSample {
    /// Observed throughput in bits per second
    pub bits_per_sec: f64,
    /// When the fetch completed
    pub at: Instant,
}

/// Rolling throughput estimator
#[derive(Debug)]
pub struct BandwidthEstimator {
    samples: VecDeque<BandwidthSample>,
    window: Duration,
    fast_ewma: f64,
    slow_ewma: f64,
    seeded: bool,
    default_bps: f64,
}

impl BandwidthEstimator {
    /// Retention weight of the fast average
    const FAST_ALPHA: f64 = 0.9;
    /// Retention weight of the slow average
    const SLOW_ALPHA: f64 = 0.95;
    /// Floor applied to degenerate fetch durations
    const MIN_DURATION_SECS: f64 = 0.001;
    /// Trailing sample-retention window
    const WINDOW: Duration = Duration::from_secs(30);

    pub fn new(default_bps: u64) -> Self {
        Self::with_window(default_bps, Self::WINDOW)
    }

    pub fn with_window(default_bps: u64, window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            fast_ewma: 0.0,
            slow_ewma: 0.0,
            seeded: false,
            default_bps: default_bps as f64,
        }
    }

    /// Record a completed fetch
    pub fn add_sample(&mut self, bytes_transferred: u64, duration: Duration) {
        let secs = duration.as_secs_f64().max(Self::MIN_DURATION_SECS);
        let bits_per_sec = bytes_transferred as f64 * 8.0 / secs;
        let now = Instant::now();

        self.samples.push_back(BandwidthSample { bits_per_sec, at: now });
        let cutoff = now.checked_sub(self.window);
        if let Some(cutoff) = cutoff {
            while self.samples.front().is_some_and(|s| s.at < cutoff) {
                self.samples.pop_front();
            }
        }

        if self.seeded {
            self.fast_ewma =
                Self::FAST_ALPHA * self.fast_ewma + (1.0 - Self::FAST_ALPHA) * bits_per_sec;
            self.slow_ewma =
                Self::SLOW_ALPHA * self.slow_ewma + (1.0 - Self::SLOW_ALPHA) * bits_per_sec;
        } else {
            self.fast_ewma = bits_per_sec;
            self.slow_ewma = bits_per_sec;
            self.seeded = true;
        }

        debug!(
            bytes = bytes_transferred,
            duration_ms = duration.as_millis(),
            sample_mbps = bits_per_sec / 1_000_000.0,
            estimate_mbps = self.estimate() as f64 / 1_000_000.0,
            "Bandwidth sample recorded"
        );
    }

    /// Conservative throughput estimate in bits per second.
    ///
    /// Returns the configured default until the first sample arrives; never
    /// zero or negative.
    pub fn estimate(&self) -> u64 {
        if !self.seeded {
            return self.default_bps.max(1.0) as u64;
        }
        self.fast_ewma.min(self.slow_ewma).max(1.0) as u64
    }

    /// Current fast-average value
    pub fn fast_estimate(&self) -> f64 {
        self.fast_ewma
    }

    /// Current slow-average value
    pub fn slow_estimate(&self) -> f64 {
        self.slow_ewma
    }

    /// Samples currently inside the retention window
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_before_first_sample() {
        let est = BandwidthEstimator::new(1_000_000);
        assert_eq!(est.estimate(), 1_000_000);
    }

    #[test]
    fn test_seeded_from_first_sample() {
        let mut est = BandwidthEstimator::new(1_000_000);
        // 1 MB in 1 s = 8 Mbps
        est.add_sample(1_000_000, Duration::from_secs(1));
        assert_eq!(est.estimate(), 8_000_000);
        assert_eq!(est.fast_estimate(), est.slow_estimate());
    }

    #[test]
    fn test_estimate_is_min_of_averages() {
        let mut est = BandwidthEstimator::new(1_000_000);
        est.add_sample(1_000_000, Duration::from_secs(1)); // 8 Mbps
        est.add_sample(4_000_000, Duration::from_secs(1)); // 32 Mbps spike

        let estimate = est.estimate() as f64;
        assert!(estimate <= est.fast_estimate().max(est.slow_estimate()));
        // The spike must not carry the estimate with it
        assert!(estimate < 32_000_000.0);
    }

    #[test]
    fn test_fast_average_reacts_faster() {
        let mut est = BandwidthEstimator::new(1_000_000);
        est.add_sample(1_000_000, Duration::from_secs(1)); // 8 Mbps
        for _ in 0..10 {
            est.add_sample(125_000, Duration::from_secs(1)); // 1 Mbps sustained drop
        }
        // With a lower retention weight the fast average has fallen further
        assert!(est.fast_estimate() < est.slow_estimate());
    }

    #[test]
    fn test_estimate_always_positive() {
        let mut est = BandwidthEstimator::new(0);
        assert!(est.estimate() > 0);

        est.add_sample(0, Duration::from_secs(1));
        assert!(est.estimate() > 0);

        est.add_sample(1_000_000, Duration::ZERO);
        assert!(est.estimate() > 0);
    }

    #[test]
    fn test_zero_duration_clamped() {
        let mut est = BandwidthEstimator::new(1_000_000);
        est.add_sample(1_000, Duration::ZERO);
        // 1000 bytes over the 1 ms floor = 8 Mbps, not infinity
        assert_eq!(est.estimate(), 8_000_000);
    }

    #[test]
    fn test_convergence_toward_sustained_rate() {
        let mut est = BandwidthEstimator::new(1_000_000);
        for _ in 0..100 {
            est.add_sample(500_000, Duration::from_secs(1)); // 4 Mbps
        }
        let estimate = est.estimate() as f64;
        assert!((estimate - 4_000_000.0).abs() / 4_000_000.0 < 0.05);
    }
}
