mod clock;
mod pacing;

pub(crate) use clock::monotonic_nanos;
pub(crate) use pacing::Pacer;
