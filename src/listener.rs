use std::sync::Arc;

use http::response::Parts;
use http::Request;
use hyper::body::Bytes;

use crate::client::RequestError;
use crate::recording::IntervalSnapshot;
use crate::resource::ResourceInfo;

/// Observes the raw request lifecycle.
///
/// Fires for every request, warmup iterations included. Callbacks may be
/// invoked concurrently from several worker threads.
pub trait RequestListener: Send + Sync + 'static {
    /// The request is about to be queued on a connection.
    fn on_begin(&self, _request: &Request<Bytes>) {}

    /// The request has been handed to the wire.
    fn on_commit(&self, _request: &Request<Bytes>) {}

    /// The response completed.
    fn on_success(&self, _request: &Request<Bytes>, _response: &Parts) {}

    /// The request failed at the transport or protocol level.
    fn on_failure(&self, _request: &Request<Bytes>, _error: &RequestError) {}
}

/// Called once per resource occurrence when it produces its terminal
/// outcome. Suppressed during warmup iterations.
pub trait NodeListener: Send + Sync + 'static {
    fn on_node(&self, info: &ResourceInfo);
}

impl<F> NodeListener for F
where
    F: Fn(&ResourceInfo) + Send + Sync + 'static,
{
    fn on_node(&self, info: &ResourceInfo) {
        self(info)
    }
}

/// Called exactly once per subtree, strictly after every node of that
/// subtree has completed. Suppressed during warmup iterations.
pub trait TreeListener: Send + Sync + 'static {
    fn on_tree(&self, info: &ResourceInfo);
}

impl<F> TreeListener for F
where
    F: Fn(&ResourceInfo) + Send + Sync + 'static,
{
    fn on_tree(&self, info: &ResourceInfo) {
        self(info)
    }
}

/// Hot-path sink for raw latency samples in nanoseconds.
pub trait LatencyListener: Send + Sync + 'static {
    fn on_latency_value(&self, nanos: u64);

    /// Terminal callback: flush and release.
    fn on_generator_stop(&self) {}
}

/// Hot-path sink for raw response-time samples in nanoseconds, keyed by
/// the resource path that produced them.
pub trait ResponseTimeListener: Send + Sync + 'static {
    fn on_response_time_value(&self, path: &str, nanos: u64);

    /// Terminal callback: flush and release.
    fn on_generator_stop(&self) {}
}

/// Receives the periodic interval snapshots produced by the scheduler,
/// plus one final snapshot at shutdown.
pub trait SnapshotListener: Send + Sync + 'static {
    fn on_interval(&self, snapshot: &IntervalSnapshot);

    /// Terminal callback: flush and release.
    fn on_generator_stop(&self) {}
}

/// The full set of observers installed on a generator. Shared across runs.
#[derive(Default)]
pub(crate) struct Listeners {
    pub(crate) request: Vec<Arc<dyn RequestListener>>,
    pub(crate) node: Vec<Arc<dyn NodeListener>>,
    pub(crate) tree: Vec<Arc<dyn TreeListener>>,
    pub(crate) latency: Vec<Arc<dyn LatencyListener>>,
    pub(crate) response_time: Vec<Arc<dyn ResponseTimeListener>>,
    pub(crate) snapshot: Vec<Arc<dyn SnapshotListener>>,
}
