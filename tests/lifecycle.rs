use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use barrage::http::{HeaderMap, Request};
use barrage::{Bytes, Error, LoadGenerator, RequestListener, Transport};
use tokio::net::TcpListener;
use tokio::time::timeout;

async fn start_server() -> SocketAddr {
    let app = Router::new().fallback(download);
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

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

#[tokio::test]
async fn interrupt_resolves_the_future_with_cancellation() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        // Iterate until interrupted.
        .iterations_per_user(0)
        .resource_rate(5)
        .build()
        .expect("build generator");

    let run = generator.begin();
    tokio::time::sleep(Duration::from_secs(1)).await;
    generator.interrupt();

    let result = timeout(Duration::from_secs(5), run)
        .await
        .expect("interrupt resolves the run in bounded time");
    assert!(matches!(result, Err(Error::Interrupted)));
}

#[tokio::test]
async fn run_for_bounds_the_run_within_one_pacing_interval() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let requests = Arc::new(AtomicU64::new(0));
    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .iterations_per_user(0)
        .resource_rate(5)
        .run_for(Duration::from_secs(2))
        .request_listener(CountRequests(requests.clone()))
        .build()
        .expect("build generator");

    let result = timeout(Duration::from_secs(4), generator.begin())
        .await
        .expect("the time bound resolves the run");
    assert!(matches!(result, Err(Error::Interrupted)));

    // Two seconds at five resources per second, give or take scheduling.
    let total = requests.load(Ordering::SeqCst);
    assert!((6..=15).contains(&total), "saw {total} requests");
}

#[tokio::test]
async fn a_second_begin_while_running_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = start_server().await;

    let generator = LoadGenerator::builder()
        .port(addr.port())
        .transport(Transport::Http1)
        .iterations_per_user(0)
        .resource_rate(5)
        .build()
        .expect("build generator");

    let first = generator.begin();
    let second = generator.begin().await;
    assert!(matches!(second, Err(Error::AlreadyRunning)));

    generator.interrupt();
    let result = timeout(Duration::from_secs(5), first)
        .await
        .expect("interrupt resolves the run in bounded time");
    assert!(matches!(result, Err(Error::Interrupted)));
}

#[tokio::test]
async fn an_unreachable_target_fails_the_completion_future() {
    let _ = tracing_subscriber::fmt::try_init();

    // Grab a port that nothing is listening on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let generator = LoadGenerator::builder()
        .host("127.0.0.1")
        .port(port)
        .transport(Transport::Http1)
        .connect_timeout(Duration::from_secs(2))
        .build()
        .expect("build generator");

    let result = timeout(Duration::from_secs(10), generator.begin())
        .await
        .expect("start failure resolves the run in bounded time");
    assert!(matches!(result, Err(Error::TransportStart(_))));
}
