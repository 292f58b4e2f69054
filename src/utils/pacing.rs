use std::cmp;
use std::time::{Duration, Instant};

/// Remaining budget below this bound is spun rather than slept; the tokio
/// timer cannot reliably wake within it.
const SPIN_WINDOW: Duration = Duration::from_micros(100);

/// Spreads a per-worker share of the engine-wide resource rate over the
/// iterations of one worker.
pub(crate) struct Pacer {
    interval: Option<Duration>,
}

impl Pacer {
    /// Derive the per-worker iteration interval from the engine-wide rate.
    /// A rate of zero disables pacing entirely.
    pub(crate) fn new(resource_rate: u64, workers: usize) -> Self {
        if resource_rate == 0 {
            return Self { interval: None };
        }
        let per_worker_rate = cmp::max(1, resource_rate / workers.max(1) as u64);
        Self {
            interval: Some(Duration::from_micros(1_000_000 / per_worker_rate)),
        }
    }

    /// Sleep out the remainder of the iteration budget. An iteration that
    /// overran its budget gets no sleep and no catch-up burst; the engine
    /// simply falls behind, which the rate-vs-actual metric makes visible.
    pub(crate) async fn pace(&self, iteration_started: Instant) {
        let Some(interval) = self.interval else {
            return;
        };
        if let Some(remaining) = interval.checked_sub(iteration_started.elapsed()) {
            sleep_precise(remaining).await;
        }
    }
}

/// High-resolution sleep: the tokio timer covers the bulk, a spin loop the
/// final stretch below the scheduler's wakeup granularity.
pub(crate) async fn sleep_precise(duration: Duration) {
    let deadline = Instant::now() + duration;
    if let Some(coarse) = duration.checked_sub(SPIN_WINDOW) {
        tokio::time::sleep(coarse).await;
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}
