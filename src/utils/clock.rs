use std::time::Instant;

use once_cell::sync::Lazy;

static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed on the process-wide monotonic timebase.
///
/// Only differences between two readings are meaningful.
pub(crate) fn monotonic_nanos() -> u64 {
    ANCHOR.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_are_monotonic() {
        let first = monotonic_nanos();
        let second = monotonic_nanos();
        assert!(second >= first);
    }
}
