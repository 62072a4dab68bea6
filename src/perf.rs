//! Performance Metrics - closed-loop timing breakdown and latency sampling.
//!
//! Collects the signal→send→ack path timings for analysis and regression
//! detection. Fed by the order worker; read offline by `latency_report`.

/// Closed-loop performance metrics.
/// Collects timing breakdown and latency samples for percentile calculation.
#[derive(Default)]
pub struct PerfMetrics {
    // Timing breakdown (nanoseconds)
    pub total_signal_to_send_ns: u64, // trigger recognized → entrust on the wire
    pub total_send_to_ack_ns: u64,    // entrust sent → broker confirmation
    pub total_cancel_roundtrip_ns: u64, // cancel sent → withdraw confirmation

    // Per-loop latency samples (signal → ack, nanoseconds)
    // Every Nth loop is sampled to keep memory bounded.
    pub latency_samples: Vec<u64>,
    sample_rate: usize,
    sample_counter: usize,
    loops_completed: u64,
}

impl PerfMetrics {
    /// Create new metrics collector with given sample rate
    ///
    /// # Arguments
    /// * `sample_rate` - Sample every Nth closed loop for latency percentiles
    pub fn new(sample_rate: usize) -> Self {
        PerfMetrics {
            sample_rate: sample_rate.max(1),
            latency_samples: Vec::with_capacity(10_000),
            ..Default::default()
        }
    }

    /// Record one completed signal→ack loop (sampled).
    #[inline]
    pub fn add_loop_latency(&mut self, latency_ns: u64) {
        self.loops_completed += 1;
        self.sample_counter += 1;
        if self.sample_counter >= self.sample_rate {
            self.latency_samples.push(latency_ns);
            self.sample_counter = 0;
        }
    }

    #[inline]
    pub fn add_signal_to_send(&mut self, ns: u64) {
        self.total_signal_to_send_ns += ns;
    }

    #[inline]
    pub fn add_send_to_ack(&mut self, ns: u64) {
        self.total_send_to_ack_ns += ns;
    }

    #[inline]
    pub fn add_cancel_roundtrip(&mut self, ns: u64) {
        self.total_cancel_roundtrip_ns += ns;
    }

    pub fn loops_completed(&self) -> u64 {
        self.loops_completed
    }

    /// Calculate percentile from samples
    ///
    /// # Arguments
    /// * `p` - Percentile (0-100), e.g., 50.0 for median, 99.0 for P99
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let mut sorted = self.latency_samples.clone();
        sorted.sort_unstable();
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn min_latency(&self) -> Option<u64> {
        self.latency_samples.iter().copied().min()
    }

    pub fn max_latency(&self) -> Option<u64> {
        self.latency_samples.iter().copied().max()
    }

    pub fn avg_latency(&self) -> Option<u64> {
        if self.latency_samples.is_empty() {
            return None;
        }
        Some(self.latency_samples.iter().sum::<u64>() / self.latency_samples.len() as u64)
    }

    /// Total tracked time (sum of all components)
    pub fn total_tracked_ns(&self) -> u64 {
        self.total_signal_to_send_ns + self.total_send_to_ack_ns + self.total_cancel_roundtrip_ns
    }

    /// Percentage breakdown (signal→send, send→ack, cancel roundtrip)
    pub fn breakdown_pct(&self) -> (f64, f64, f64) {
        let total = self.total_tracked_ns() as f64;
        if total == 0.0 {
            return (0.0, 0.0, 0.0);
        }
        (
            self.total_signal_to_send_ns as f64 / total * 100.0,
            self.total_send_to_ack_ns as f64 / total * 100.0,
            self.total_cancel_roundtrip_ns as f64 / total * 100.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let mut perf = PerfMetrics::new(1); // Sample every loop
        for i in 1..=100 {
            perf.add_loop_latency(i);
        }

        assert_eq!(perf.loops_completed(), 100);
        assert_eq!(perf.min_latency(), Some(1));
        assert_eq!(perf.max_latency(), Some(100));
        let p50 = perf.percentile(50.0).unwrap();
        assert!(p50 == 50 || p50 == 51, "P50 should be ~50, got {}", p50);
        assert_eq!(perf.percentile(99.0), Some(99));
    }

    #[test]
    fn test_sampling_rate() {
        let mut perf = PerfMetrics::new(10);
        for i in 1..=100 {
            perf.add_loop_latency(i);
        }
        assert_eq!(perf.latency_samples.len(), 10);
        assert_eq!(perf.loops_completed(), 100);
    }

    #[test]
    fn test_breakdown() {
        let mut perf = PerfMetrics::new(1);
        perf.add_signal_to_send(100);
        perf.add_send_to_ack(300);
        perf.add_cancel_roundtrip(600);

        assert_eq!(perf.total_tracked_ns(), 1000);

        let (sig, ack, cxl) = perf.breakdown_pct();
        assert!((sig - 10.0).abs() < 0.1);
        assert!((ack - 30.0).abs() < 0.1);
        assert!((cxl - 60.0).abs() < 0.1);
    }

    #[test]
    fn test_empty_metrics() {
        let perf = PerfMetrics::new(10);
        assert_eq!(perf.percentile(50.0), None);
        assert_eq!(perf.avg_latency(), None);
        assert_eq!(perf.breakdown_pct(), (0.0, 0.0, 0.0));
    }
}
