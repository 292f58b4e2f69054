use std::collections::HashMap;
use std::fmt;

use hdrhistogram::Histogram;

/// Microsecond digest of one interval histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub count: u64,
    pub min_micros: u64,
    pub max_micros: u64,
    pub mean_micros: f64,
    pub stdev_micros: f64,
    pub p50_micros: u64,
    pub p90_micros: u64,
    pub p99_micros: u64,
    pub p999_micros: u64,
}

impl Summary {
    /// Summarise a histogram whose values were recorded in nanoseconds.
    pub fn from_nanos(histogram: &Histogram<u64>) -> Self {
        Self {
            count: histogram.len(),
            min_micros: histogram.min() / 1_000,
            max_micros: histogram.max() / 1_000,
            mean_micros: histogram.mean() / 1_000.0,
            stdev_micros: histogram.stdev() / 1_000.0,
            p50_micros: histogram.value_at_quantile(0.5) / 1_000,
            p90_micros: histogram.value_at_quantile(0.9) / 1_000,
            p99_micros: histogram.value_at_quantile(0.99) / 1_000,
            p999_micros: histogram.value_at_quantile(0.999) / 1_000,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} min={}us max={}us mean={:.2}us stdev={:.2}us \
             p50={}us p90={}us p99={}us p99.9={}us",
            self.count,
            self.min_micros,
            self.max_micros,
            self.mean_micros,
            self.stdev_micros,
            self.p50_micros,
            self.p90_micros,
            self.p99_micros,
            self.p999_micros,
        )
    }
}

/// One tick of the periodic snapshot task: the interval histograms plus
/// their digests, covering everything recorded since the previous tick.
pub struct IntervalSnapshot {
    pub latency: Histogram<u64>,
    pub latency_summary: Summary,
    pub response_time: Histogram<u64>,
    pub response_time_summary: Summary,
    /// Per-path response-time digests, keyed by resource path.
    pub response_time_per_path: HashMap<String, Summary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::IntervalRecorder;

    #[test]
    fn summary_converts_to_micros() {
        let recorder = IntervalRecorder::new();
        recorder.record(1_000_000);
        recorder.record(2_000_000);
        recorder.record(3_000_000);

        let summary = Summary::from_nanos(&recorder.interval_snapshot());
        assert_eq!(summary.count, 3);
        // 3 significant digits: values land within 0.1% of what was recorded.
        assert!((990..=1_010).contains(&summary.min_micros));
        assert!((2_970..=3_030).contains(&summary.max_micros));
        assert!((1_900..=2_100).contains(&(summary.mean_micros as u64)));
        assert!((1_980..=2_020).contains(&summary.p50_micros));
    }

    #[test]
    fn empty_histogram_summarises_to_zeroes() {
        let recorder = IntervalRecorder::new();
        let summary = Summary::from_nanos(&recorder.interval_snapshot());
        assert_eq!(summary.count, 0);
        assert_eq!(summary.max_micros, 0);
        assert_eq!(summary.p999_micros, 0);
    }
}
