use crate::listener::SnapshotListener;
use crate::recording::IntervalSnapshot;

/// Logs each interval digest through `tracing`.
///
/// Install together with a snapshot period for live console output during
/// long runs.
#[derive(Debug, Default)]
pub struct SummaryLogListener;

impl SnapshotListener for SummaryLogListener {
    fn on_interval(&self, snapshot: &IntervalSnapshot) {
        if snapshot.latency_summary.count == 0 && snapshot.response_time_summary.count == 0 {
            return;
        }
        info!(
            latency = %snapshot.latency_summary,
            response_time = %snapshot.response_time_summary,
            "interval statistics"
        );
        for (path, summary) in &snapshot.response_time_per_path {
            debug!(path = path.as_str(), response_time = %summary, "per-path response time");
        }
    }
}
