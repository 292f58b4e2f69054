use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use barrage::http::{HeaderMap, Method, Request};
use barrage::{
    Bytes,
    IntervalSnapshot,
    LatencyListener,
    LoadGenerator,
    RequestListener,
    Resource,
    ResourceInfo,
    ResponseTimeListener,
    SnapshotListener,
    State,
    Transport,
};
use tokio::time::timeout;

const COMPLETION_BOUND: Duration = Duration::from_secs(5);

async fn start_server() -> SocketAddr {
    let app = Router::new().fallback(download);
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

/// Echo a body of exactly `x-download` zero bytes, any method, any path.
async fn download(headers: HeaderMap) -> Vec<u8> {
    let length = headers
        .get("x-download")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    vec![0u8; length]
}

struct CountRequests(Arc<AtomicU64>);

impl RequestListener for CountRequests {
    fn on_begin(&self, _request: &Request<Bytes>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct RecordThreadNames(Arc<Mutex<HashSet<String>>>);

impl RequestListener for RecordThreadNames {
    fn on_begin(&self, _request: &Request<Bytes>) {
        let name = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.0.lock().unwrap().insert(name);
    }
}

#[tokio::test]
async fn default_configuration_issues_exactly_one_request() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let requests = Arc::new(AtomicU64::new(0));
    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .request_listener(CountRequests(requests.clone()))
        .build()
        .expect("build generator");

    timeout(COMPLETION_BOUND, generator.begin())
        .await
        .expect("run completes in time")
        .expect("run succeeds");

    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(generator.state(), State::Stopped);
}

#[tokio::test]
async fn each_user_runs_on_its_own_thread() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let threads = Arc::new(Mutex::new(HashSet::new()));
    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .users(2)
        .iterations_per_user(1)
        .request_listener(RecordThreadNames(threads.clone()))
        .build()
        .expect("build generator");

    timeout(COMPLETION_BOUND, generator.begin())
        .await
        .expect("run completes in time")
        .expect("run succeeds");

    assert_eq!(threads.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn resource_trees_complete_parents_before_children() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let node_events = events.clone();
    let node_statuses = statuses.clone();
    let tree_events = events.clone();
    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .resource(
            Resource::new("/").response_length(16 * 1024).child(
                Resource::new("/1")
                    .response_length(10 * 1024)
                    .child(Resource::new("/11").response_length(1024)),
            ),
        )
        .node_listener(move |info: &ResourceInfo| {
            let path = info.resource().path().unwrap_or("<group>").to_string();
            node_events.lock().unwrap().push(path);
            node_statuses.lock().unwrap().push(info.status());
        })
        .tree_listener(move |info: &ResourceInfo| {
            let path = info.resource().path().unwrap_or("<group>");
            tree_events.lock().unwrap().push(format!("tree:{path}"));
        })
        .build()
        .expect("build generator");

    timeout(COMPLETION_BOUND, generator.begin())
        .await
        .expect("run completes in time")
        .expect("run succeeds");

    assert_eq!(
        *events.lock().unwrap(),
        vec!["/", "/1", "/11", "tree:/"]
    );
    assert!(statuses.lock().unwrap().iter().all(|&status| status == 200));
}

#[tokio::test]
async fn group_nodes_issue_children_without_a_request() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let node_events = events.clone();
    let tree_events = events.clone();
    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .resource(Resource::group().child(Resource::new("/1").response_length(10 * 1024)))
        .node_listener(move |info: &ResourceInfo| {
            let path = info.resource().path().unwrap_or("<group>").to_string();
            node_events.lock().unwrap().push(path);
        })
        .tree_listener(move |info: &ResourceInfo| {
            if info.resource().path().is_none() {
                tree_events.lock().unwrap().push("<group>".to_string());
            }
        })
        .build()
        .expect("build generator");

    timeout(COMPLETION_BOUND, generator.begin())
        .await
        .expect("run completes in time")
        .expect("run succeeds");

    assert_eq!(*events.lock().unwrap(), vec!["/1", "<group>"]);
}

#[tokio::test]
async fn warmup_iterations_fire_request_but_not_node_listeners() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let requests = Arc::new(AtomicU64::new(0));
    let nodes = Arc::new(AtomicU64::new(0));
    let node_count = nodes.clone();
    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .warmup_iterations_per_user(2)
        .iterations_per_user(3)
        .resource_rate(5)
        .resource(
            Resource::new("/")
                .method(Method::POST)
                .response_length(1024),
        )
        .request_listener(CountRequests(requests.clone()))
        .node_listener(move |_: &ResourceInfo| {
            node_count.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("build generator");

    timeout(COMPLETION_BOUND, generator.begin())
        .await
        .expect("run completes in time")
        .expect("run succeeds");

    assert_eq!(requests.load(Ordering::SeqCst), 5);
    assert_eq!(nodes.load(Ordering::SeqCst), 3);
}

struct SumSnapshots(Arc<AtomicU64>);

impl SnapshotListener for SumSnapshots {
    fn on_interval(&self, snapshot: &IntervalSnapshot) {
        self.0
            .fetch_add(snapshot.latency_summary.count, Ordering::SeqCst);
    }
}

struct CountLatencySamples {
    samples: Arc<AtomicU64>,
    stops: Arc<AtomicU64>,
}

impl LatencyListener for CountLatencySamples {
    fn on_latency_value(&self, _nanos: u64) {
        self.samples.fetch_add(1, Ordering::SeqCst);
    }

    fn on_generator_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountPathSamples(Arc<AtomicU64>);

impl ResponseTimeListener for CountPathSamples {
    fn on_response_time_value(&self, path: &str, _nanos: u64) {
        assert_eq!(path, "/");
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn samples_reach_the_hot_path_sinks_and_snapshots() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let snapshot_total = Arc::new(AtomicU64::new(0));
    let latency_samples = Arc::new(AtomicU64::new(0));
    let response_time_samples = Arc::new(AtomicU64::new(0));
    let stops = Arc::new(AtomicU64::new(0));

    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .iterations_per_user(3)
        .resource_rate(5)
        .resource(Resource::new("/").response_length(1024))
        .snapshot_schedule(Duration::ZERO, Duration::from_millis(200))
        .snapshot_listener(SumSnapshots(snapshot_total.clone()))
        .latency_listener(CountLatencySamples {
            samples: latency_samples.clone(),
            stops: stops.clone(),
        })
        .response_time_listener(CountPathSamples(response_time_samples.clone()))
        .build()
        .expect("build generator");

    timeout(COMPLETION_BOUND, generator.begin())
        .await
        .expect("run completes in time")
        .expect("run succeeds");

    // The final flush guarantees no sample is lost between ticks.
    assert_eq!(snapshot_total.load(Ordering::SeqCst), 3);
    assert_eq!(latency_samples.load(Ordering::SeqCst), 3);
    assert_eq!(response_time_samples.load(Ordering::SeqCst), 3);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_generator_is_reusable_for_a_second_run() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let requests = Arc::new(AtomicU64::new(0));
    let nodes = Arc::new(AtomicU64::new(0));
    let node_count = nodes.clone();
    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .iterations_per_user(3)
        .resource_rate(5)
        .resource(Resource::new("/").response_length(1024))
        .request_listener(CountRequests(requests.clone()))
        .node_listener(move |_: &ResourceInfo| {
            node_count.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("build generator");

    timeout(COMPLETION_BOUND, generator.begin())
        .await
        .expect("first run completes in time")
        .expect("first run succeeds");
    assert_eq!(requests.load(Ordering::SeqCst), 3);
    assert_eq!(nodes.load(Ordering::SeqCst), 3);
    assert_eq!(generator.state(), State::Stopped);

    requests.store(0, Ordering::SeqCst);
    nodes.store(0, Ordering::SeqCst);

    timeout(COMPLETION_BOUND, generator.begin())
        .await
        .expect("second run completes in time")
        .expect("second run succeeds");
    assert_eq!(requests.load(Ordering::SeqCst), 3);
    assert_eq!(nodes.load(Ordering::SeqCst), 3);
}
