//! Broker round-trip latency statistics.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use statrs::statistics::{Data, OrderStatistics, Statistics};

/// Samples kept for percentile estimation.
const WINDOW: usize = 512;

/// Rolling window of broker call latencies.
#[derive(Debug, Clone, Default)]
pub struct LatencyTracker {
    samples_ms: VecDeque<f64>,
    total_calls: u64,
}

/// Point-in-time latency summary in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.samples_ms.len() == WINDOW {
            self.samples_ms.pop_front();
        }
        self.samples_ms.push_back(elapsed.as_secs_f64() * 1000.0);
        self.total_calls += 1;
    }

    pub fn summary(&self) -> LatencySummary {
        if self.samples_ms.is_empty() {
            return LatencySummary::default();
        }

        let samples: Vec<f64> = self.samples_ms.iter().copied().collect();
        let mean_ms = Statistics::mean(samples.iter());
        let max_ms = Statistics::max(samples.iter());

        let mut data = Data::new(samples);
        LatencySummary {
            count: self.total_calls,
            mean_ms,
            p50_ms: data.percentile(50),
            p95_ms: data.percentile(95),
            max_ms,
        }
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} calls, mean {:.1}ms, p50 {:.1}ms, p95 {:.1}ms, max {:.1}ms",
            self.count, self.mean_ms, self.p50_ms, self.p95_ms, self.max_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        assert_eq!(LatencyTracker::new().summary(), LatencySummary::default());
    }

    #[test]
    fn test_summary_statistics() {
        let mut tracker = LatencyTracker::new();
        for ms in [10, 20, 30, 40, 100] {
            tracker.record(Duration::from_millis(ms));
        }

        let summary = tracker.summary();
        assert_eq!(summary.count, 5);
        assert!((summary.mean_ms - 40.0).abs() < 1e-9);
        assert!((summary.max_ms - 100.0).abs() < 1e-9);
        assert!(summary.p50_ms >= 20.0 && summary.p50_ms <= 40.0);
        assert!(summary.p95_ms > summary.p50_ms);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut tracker = LatencyTracker::new();
        for _ in 0..(WINDOW + 10) {
            tracker.record(Duration::from_millis(1));
        }
        assert_eq!(tracker.samples_ms.len(), WINDOW);
        assert_eq!(tracker.summary().count, (WINDOW + 10) as u64);
    }
}
