use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use hdrhistogram::Histogram;

/// Values below one microsecond collapse into the first bucket.
pub(crate) const LOWEST_DISCERNIBLE_NANOS: u64 = 1_000;
/// One minute, the ceiling of the trackable range.
pub(crate) const HIGHEST_TRACKABLE_NANOS: u64 = 60 * 1_000_000_000;
pub(crate) const SIGNIFICANT_DIGITS: u8 = 3;

fn empty_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(
        LOWEST_DISCERNIBLE_NANOS,
        HIGHEST_TRACKABLE_NANOS,
        SIGNIFICANT_DIGITS,
    )
    .expect("histogram bounds are constant")
}

/// A histogram with interval snapshotting: [`interval_snapshot`] hands back
/// everything recorded since the previous snapshot and atomically resets
/// the interval window.
///
/// [`interval_snapshot`]: IntervalRecorder::interval_snapshot
pub struct IntervalRecorder {
    live: Mutex<Histogram<u64>>,
}

impl IntervalRecorder {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(empty_histogram()),
        }
    }

    /// Record one value in nanoseconds. Out-of-range values saturate at the
    /// edges of the trackable range.
    pub fn record(&self, nanos: u64) {
        self.lock().saturating_record(nanos);
    }

    /// The histogram of values recorded since the previous snapshot.
    pub fn interval_snapshot(&self) -> Histogram<u64> {
        mem::replace(&mut *self.lock(), empty_histogram())
    }

    fn lock(&self) -> MutexGuard<'_, Histogram<u64>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for IntervalRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Response-time recorders keyed by request path.
///
/// Keys are inserted lazily on first observation and never removed during
/// a run. Concurrent first observations of the same path race benignly:
/// recorders are interchangeable and the losing insert is discarded.
pub(crate) struct PathRecorders {
    by_path: RwLock<HashMap<String, Arc<IntervalRecorder>>>,
}

impl PathRecorders {
    pub(crate) fn new() -> Self {
        Self {
            by_path: RwLock::new(HashMap::new()),
        }
    }

    /// The recorder for `path`, inserting one on first observation.
    pub(crate) fn recorder(&self, path: &str) -> Arc<IntervalRecorder> {
        let map = self
            .by_path
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(recorder) = map.get(path) {
            return recorder.clone();
        }
        drop(map);

        let mut map = self
            .by_path
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(path.to_owned())
            .or_insert_with(|| Arc::new(IntervalRecorder::new()))
            .clone()
    }

    /// Interval histograms for every observed path.
    pub(crate) fn interval_snapshots(&self) -> HashMap<String, Histogram<u64>> {
        let map = self
            .by_path
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .map(|(path, recorder)| (path.clone(), recorder.interval_snapshot()))
            .collect()
    }
}
