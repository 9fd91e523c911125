//! In-memory latency histogram for deep-scan instrumentation.
//! One sample per ticker, from dispatch to result, in milliseconds.

use std::time::Duration;

use hdrhistogram::Histogram;

use crate::types::LatencySummary;

/// Upper bound on a recorded sample: one hour.
const MAX_MS: u64 = 3_600_000;

pub struct LatencyStats {
    /// `None` only if the histogram could not be allocated; recording is then a no-op.
    inner: Option<Histogram<u64>>,
}

impl LatencyStats {
    /// Tracks 1ms to 1h, 3 significant figures.
    pub fn new() -> Self {
        Self { inner: Histogram::new_with_bounds(1, MAX_MS, 3).ok() }
    }

    pub fn record(&mut self, d: Duration) {
        let ms = (d.as_millis().min(u128::from(MAX_MS)) as u64).max(1);
        if let Some(h) = self.inner.as_mut() {
            let _ = h.record(ms);
        }
    }

    /// p50 / p95 / p99. All `None` without samples.
    pub fn summary(&self) -> LatencySummary {
        match &self.inner {
            Some(h) if h.len() > 0 => LatencySummary {
                p50_ms: Some(h.value_at_quantile(0.5)),
                p95_ms: Some(h.value_at_quantile(0.95)),
                p99_ms: Some(h.value_at_quantile(0.99)),
            },
            _ => LatencySummary::default(),
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let stats = LatencyStats::new();
        assert_eq!(stats.summary(), LatencySummary::default());
    }

    #[test]
    fn percentiles_follow_samples() {
        let mut stats = LatencyStats::new();
        for ms in 1..=100 {
            stats.record(Duration::from_millis(ms));
        }
        let s = stats.summary();
        assert!(s.p50_ms.unwrap().abs_diff(50) <= 1);
        assert!(s.p99_ms.unwrap().abs_diff(99) <= 1);
        assert!(s.p50_ms <= s.p95_ms && s.p95_ms <= s.p99_ms);
    }

    #[test]
    fn huge_samples_are_clamped() {
        let mut stats = LatencyStats::new();
        stats.record(Duration::from_secs(10 * 3600));
        assert!(stats.summary().p50_ms.unwrap() <= MAX_MS + MAX_MS / 100);
    }
}
