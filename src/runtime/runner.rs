use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{join_all, BoxFuture};
use http::{header, HeaderValue, Request};
use hyper::body::Bytes;

use crate::builder::Config;
use crate::client::{ClientPool, Connector, Exchange, RequestError, StartError};
use crate::handler::ResultHandler;
use crate::resource::{Resource, ResourceInfo};
use crate::runtime::RunState;
use crate::utils::{monotonic_nanos, Pacer};

/// Asks the server for a response body of exactly this many bytes.
pub(crate) const DOWNLOAD_HEADER: &str = "x-download";
/// Monotonic nanosecond timestamp stamped at the moment of send and read
/// back on completion, so latency is computed independently of any client
/// internal timing.
pub(crate) const AFTER_SEND_TIME_HEADER: &str = "after-send-time";
const SESSION_COOKIE: &str = "barrage-session";

/// Cooperative stop signal shared by the engine and every worker.
#[derive(Default, Clone)]
pub(crate) struct ShutdownHandle {
    should_stop: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub(crate) fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }

    pub(crate) fn stop(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
    }

    /// Stop, remembering that the stop was an explicit cancellation rather
    /// than a natural end of the workload.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
        self.stop();
    }

    pub(crate) fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunnerState {
    Idle,
    Warming,
    Running,
    Draining,
    Done,
}

pub(crate) struct RunnerContext {
    pub(crate) worker_id: usize,
    pub(crate) config: Arc<Config>,
    pub(crate) handler: Arc<ResultHandler>,
    pub(crate) stop: ShutdownHandle,
    pub(crate) connector: Connector,
    pub(crate) run_state: Arc<RunState>,
}

pub(crate) struct RunnerReport {
    pub(crate) worker_id: usize,
    pub(crate) iterations: u64,
}

/// One worker: a dedicated client pool driven through the profile until
/// the iteration bound is reached or the stop flag is raised.
pub(crate) struct Runner {
    worker_id: usize,
    config: Arc<Config>,
    handler: Arc<ResultHandler>,
    stop: ShutdownHandle,
    pool: ClientPool,
    pacer: Pacer,
    session_cookie: HeaderValue,
    state: RunnerState,
}

impl Runner {
    pub(crate) async fn run(context: RunnerContext) -> Result<RunnerReport, StartError> {
        let RunnerContext {
            worker_id,
            config,
            handler,
            stop,
            connector,
            run_state,
        } = context;

        let pool_size = config.transport.connections_per_destination();
        let pool = ClientPool::connect(connector, pool_size, config.selectors).await;
        let pool = match pool {
            Ok(pool) => pool,
            Err(e) => {
                // One message is enough when every worker fails the same way.
                if !stop.should_stop() {
                    error!(worker_id, error = %e, "failed to start the client, aborting run");
                    stop.stop();
                }
                return Err(e);
            }
        };

        // The cookie ties every request of this worker to one session.
        let session = format!("{SESSION_COOKIE}={}", monotonic_nanos());
        let session_cookie =
            HeaderValue::from_str(&session).expect("cookie value is ASCII");

        let pacer = Pacer::new(config.resource_rate, config.users);
        let mut runner = Runner {
            worker_id,
            config,
            handler,
            stop,
            pool,
            pacer,
            session_cookie,
            state: RunnerState::Idle,
        };

        let warmup = runner.config.warmup_iterations_per_user;
        if warmup > 0 {
            runner.transition(RunnerState::Warming);
            for _ in 0..warmup {
                if runner.stop.should_stop() {
                    break;
                }
                let started = Instant::now();
                runner.iterate(true).await;
                if runner.stop.should_stop() {
                    break;
                }
                runner.pacer.pace(started).await;
            }
        }
        run_state.note_warmup_complete();

        runner.transition(RunnerState::Running);
        let bound = runner.config.iterations_per_user;
        let mut iterations = 0u64;
        loop {
            if runner.stop.should_stop() {
                break;
            }
            if bound != 0 && iterations == bound {
                break;
            }
            let started = Instant::now();
            runner.iterate(false).await;
            iterations += 1;
            if runner.stop.should_stop() {
                break;
            }
            runner.pacer.pace(started).await;
        }

        // In-flight subtrees are awaited inline, so by the time the loop
        // exits there is nothing left on the wire.
        runner.transition(RunnerState::Draining);
        drop(runner.pool);
        runner.state = RunnerState::Done;
        debug!(worker_id = runner.worker_id, iterations, "worker finished");

        Ok(RunnerReport {
            worker_id: runner.worker_id,
            iterations,
        })
    }

    fn transition(&mut self, next: RunnerState) {
        trace!(
            worker_id = self.worker_id,
            from = ?self.state,
            to = ?next,
            "worker state change"
        );
        self.state = next;
    }

    /// One full traversal of the profile, roots in declared order.
    async fn iterate(&self, warmup: bool) {
        for root in &self.config.resources {
            if self.stop.should_stop() {
                break;
            }
            let info = self.issue_subtree(root, warmup).await;
            self.handler.on_tree_complete(&info, warmup);
        }
    }

    /// Issue every request of the subtree rooted at `resource`.
    ///
    /// Children start once the parent response has begun, modelling a
    /// browser-style waterfall; a group node starts its children at once.
    /// The returned future resolves only after every descendant has
    /// reached a terminal outcome.
    fn issue_subtree<'a>(
        &'a self,
        resource: &'a Arc<Resource>,
        warmup: bool,
    ) -> BoxFuture<'a, ResourceInfo> {
        Box::pin(async move {
            let mut info = ResourceInfo::new(resource.clone());

            if resource.path.is_none() {
                let _ = join_all(
                    resource
                        .children
                        .iter()
                        .map(|child| self.issue_subtree(child, warmup)),
                )
                .await;
                return info;
            }

            let mut request = match self.build_request(resource) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "could not build request for resource");
                    return info;
                }
            };

            self.handler.on_request_begin(&request);

            let mut lease = match self.pool.lease().await {
                Ok(lease) => lease,
                Err(e) => {
                    self.handler.on_request_failure(&request, &e);
                    return info;
                }
            };

            let send_nanos = monotonic_nanos();
            request
                .headers_mut()
                .insert(AFTER_SEND_TIME_HEADER, HeaderValue::from(send_nanos));
            self.handler.on_request_commit(&request);

            let exchange = match lease.send(&request).await {
                Ok(exchange) => exchange,
                Err(e) => {
                    self.handler.on_request_failure(&request, &e);
                    return info;
                }
            };

            let Exchange {
                parts,
                response_begin_nanos,
                body,
            } = exchange;
            let status = parts.status.as_u16();
            info.request_start_nanos = sent_timestamp(&request).unwrap_or(send_nanos);
            info.response_begin_nanos = response_begin_nanos;
            info.bytes_sent = resource.request_length;

            let (info, _children) = tokio::join!(
                async {
                    match body.drain().await {
                        Ok(received) => {
                            info.response_end_nanos = monotonic_nanos();
                            info.status = status;
                            info.bytes_received = received;
                            let failed = self.handler.treats_http_errors_as_failures()
                                && status >= 400;
                            if failed {
                                self.handler.on_request_failure(
                                    &request,
                                    &RequestError::HttpStatus(status),
                                );
                            } else {
                                self.handler.on_request_success(&request, &parts);
                                self.handler.on_node_complete(&info, warmup);
                            }
                        }
                        Err(e) => {
                            lease.mark_dead();
                            self.handler.on_request_failure(&request, &e);
                        }
                    }
                    drop(lease);
                    info
                },
                join_all(
                    resource
                        .children
                        .iter()
                        .map(|child| self.issue_subtree(child, warmup)),
                ),
            );

            info
        })
    }

    fn build_request(&self, resource: &Resource) -> Result<Request<Bytes>, http::Error> {
        let path = resource.path.as_deref().unwrap_or("/");
        let url = format!(
            "{}://{}:{}{}",
            self.config.transport.scheme(),
            self.config.host,
            self.config.port,
            path
        );

        let mut builder = Request::builder()
            .method(resource.method.clone())
            .uri(url)
            .header(header::COOKIE, self.session_cookie.clone());
        if resource.response_length > 0 {
            builder = builder.header(DOWNLOAD_HEADER, resource.response_length);
        }

        let body = if resource.request_length > 0 {
            Bytes::from(vec![0u8; resource.request_length as usize])
        } else {
            Bytes::new()
        };
        builder.body(body)
    }
}

/// Read the send timestamp back off the completed request.
fn sent_timestamp(request: &Request<Bytes>) -> Option<u64> {
    request
        .headers()
        .get(AFTER_SEND_TIME_HEADER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
