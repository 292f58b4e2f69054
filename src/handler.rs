use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use http::response::Parts;
use http::Request;
use hyper::body::Bytes;

use crate::client::RequestError;
use crate::listener::Listeners;
use crate::recording::{IntervalRecorder, IntervalSnapshot, PathRecorders, Summary};
use crate::resource::ResourceInfo;

/// The hot-path sink for per-request outcomes.
///
/// One handler exists per run; it owns the run's recorders and fans events
/// out to the installed observers. Request-level callbacks fire for every
/// request, warmup included; resource-level callbacks and histogram
/// updates only happen for measured iterations of an active run.
pub(crate) struct ResultHandler {
    latency: IntervalRecorder,
    response_time: IntervalRecorder,
    response_time_per_path: PathRecorders,
    listeners: Arc<Listeners>,
    failed_requests: AtomicU64,
    recording: AtomicBool,
    treat_http_errors_as_failures: bool,
}

impl ResultHandler {
    pub(crate) fn new(
        listeners: Arc<Listeners>,
        treat_http_errors_as_failures: bool,
    ) -> Self {
        Self {
            latency: IntervalRecorder::new(),
            response_time: IntervalRecorder::new(),
            response_time_per_path: PathRecorders::new(),
            listeners,
            failed_requests: AtomicU64::new(0),
            recording: AtomicBool::new(false),
            treat_http_errors_as_failures,
        }
    }

    pub(crate) fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    pub(crate) fn treats_http_errors_as_failures(&self) -> bool {
        self.treat_http_errors_as_failures
    }

    pub(crate) fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn on_request_begin(&self, request: &Request<Bytes>) {
        for listener in &self.listeners.request {
            guarded(|| listener.on_begin(request));
        }
    }

    pub(crate) fn on_request_commit(&self, request: &Request<Bytes>) {
        for listener in &self.listeners.request {
            guarded(|| listener.on_commit(request));
        }
    }

    pub(crate) fn on_request_success(&self, request: &Request<Bytes>, response: &Parts) {
        for listener in &self.listeners.request {
            guarded(|| listener.on_success(request, response));
        }
    }

    pub(crate) fn on_request_failure(&self, request: &Request<Bytes>, error: &RequestError) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        debug!(error = %error, path = request.uri().path(), "request failed");
        for listener in &self.listeners.request {
            guarded(|| listener.on_failure(request, error));
        }
    }

    /// Terminal outcome for one successful resource occurrence.
    pub(crate) fn on_node_complete(&self, info: &ResourceInfo, warmup: bool) {
        if warmup || !self.recording.load(Ordering::Acquire) {
            return;
        }

        let latency = info.latency_nanos();
        let response_time = info.response_time_nanos();
        self.latency.record(latency);
        self.response_time.record(response_time);

        if let Some(path) = info.resource().path() {
            self.response_time_per_path
                .recorder(path)
                .record(response_time);
            for listener in &self.listeners.response_time {
                guarded(|| listener.on_response_time_value(path, response_time));
            }
        }
        for listener in &self.listeners.latency {
            guarded(|| listener.on_latency_value(latency));
        }
        for listener in &self.listeners.node {
            guarded(|| listener.on_node(info));
        }
    }

    /// Fired exactly once per subtree, after every node of the subtree has
    /// reached a terminal outcome.
    pub(crate) fn on_tree_complete(&self, info: &ResourceInfo, warmup: bool) {
        if warmup || !self.recording.load(Ordering::Acquire) {
            return;
        }
        for listener in &self.listeners.tree {
            guarded(|| listener.on_tree(info));
        }
    }

    /// Snapshot every recorder over the window since the previous snapshot.
    pub(crate) fn interval_snapshot(&self) -> IntervalSnapshot {
        let latency = self.latency.interval_snapshot();
        let response_time = self.response_time.interval_snapshot();
        let response_time_per_path: HashMap<String, Summary> = self
            .response_time_per_path
            .interval_snapshots()
            .into_iter()
            .map(|(path, histogram)| (path, Summary::from_nanos(&histogram)))
            .collect();

        IntervalSnapshot {
            latency_summary: Summary::from_nanos(&latency),
            response_time_summary: Summary::from_nanos(&response_time),
            latency,
            response_time,
            response_time_per_path,
        }
    }
}

/// Observer callbacks must not take the run down with them: panics are
/// caught and logged.
pub(crate) fn guarded<F: FnOnce()>(callback: F) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("a listener panicked; the run continues");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::listener::NodeListener;
    use crate::resource::Resource;

    fn info_with_timings(path: &str) -> ResourceInfo {
        let mut info = ResourceInfo::new(Arc::new(Resource::new(path)));
        info.request_start_nanos = 1_000;
        info.response_begin_nanos = 2_001_000;
        info.response_end_nanos = 5_001_000;
        info.status = 200;
        info
    }

    fn counting_listeners(counter: Arc<AtomicUsize>) -> Arc<Listeners> {
        let mut listeners = Listeners::default();
        let node = move |_: &ResourceInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        listeners.node.push(Arc::new(node) as Arc<dyn NodeListener>);
        Arc::new(listeners)
    }

    #[test]
    fn warmup_outcomes_are_discarded() {
        let nodes = Arc::new(AtomicUsize::new(0));
        let handler = ResultHandler::new(counting_listeners(nodes.clone()), false);
        handler.set_recording(true);

        handler.on_node_complete(&info_with_timings("/"), true);
        assert_eq!(nodes.load(Ordering::SeqCst), 0);
        assert_eq!(handler.interval_snapshot().latency_summary.count, 0);

        handler.on_node_complete(&info_with_timings("/"), false);
        assert_eq!(nodes.load(Ordering::SeqCst), 1);

        let snapshot = handler.interval_snapshot();
        assert_eq!(snapshot.latency_summary.count, 1);
        assert_eq!(snapshot.response_time_per_path.len(), 1);
    }

    #[test]
    fn nothing_is_recorded_outside_an_active_run() {
        let nodes = Arc::new(AtomicUsize::new(0));
        let handler = ResultHandler::new(counting_listeners(nodes.clone()), false);

        handler.on_node_complete(&info_with_timings("/"), false);
        assert_eq!(nodes.load(Ordering::SeqCst), 0);
        assert_eq!(handler.interval_snapshot().latency_summary.count, 0);
    }

    #[test]
    fn panicking_listeners_do_not_stop_the_run() {
        let mut listeners = Listeners::default();
        let panicking = |_: &ResourceInfo| {
            panic!("boom");
        };
        listeners
            .node
            .push(Arc::new(panicking) as Arc<dyn NodeListener>);
        let handler = ResultHandler::new(Arc::new(listeners), false);
        handler.set_recording(true);

        handler.on_node_complete(&info_with_timings("/"), false);
        assert_eq!(handler.interval_snapshot().latency_summary.count, 1);
    }
}
