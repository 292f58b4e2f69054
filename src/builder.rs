use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use crate::client::Transport;
use crate::listener::{
    LatencyListener,
    Listeners,
    NodeListener,
    RequestListener,
    ResponseTimeListener,
    SnapshotListener,
    TreeListener,
};
use crate::resource::Resource;
use crate::runtime::LoadGenerator;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SNAPSHOT_PERIOD: Duration = Duration::from_secs(1);

/// The configuration is invalid; no generator was created and no resources
/// were allocated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("users must be at least 1")]
    NoUsers,
    #[error("host must not be empty")]
    MissingHost,
    #[error("port must be at least 1")]
    InvalidPort,
    #[error("at least one resource must be configured")]
    NoResources,
    #[error("a transport must be selected")]
    NoTransport,
    #[error("resource path {0:?} does not form a valid request target")]
    InvalidResourcePath(String),
}

/// Validated engine configuration, shared read-only across runs.
pub(crate) struct Config {
    pub(crate) users: usize,
    pub(crate) iterations_per_user: u64,
    pub(crate) warmup_iterations_per_user: u64,
    pub(crate) resource_rate: u64,
    pub(crate) run_for: Option<Duration>,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) transport: Transport,
    pub(crate) selectors: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) resources: Vec<Arc<Resource>>,
    pub(crate) treat_http_errors_as_failures: bool,
    pub(crate) snapshot_initial_delay: Duration,
    pub(crate) snapshot_period: Duration,
}

impl Config {
    /// Requests issued by one full iteration over the profile.
    pub(crate) fn resources_per_iteration(&self) -> usize {
        self.resources.iter().map(|root| root.count()).sum()
    }
}

/// Assembles a [`LoadGenerator`] from a validated configuration.
pub struct Builder {
    users: usize,
    iterations_per_user: u64,
    warmup_iterations_per_user: u64,
    resource_rate: u64,
    run_for: Option<Duration>,
    host: String,
    port: u16,
    transport: Option<Transport>,
    selectors: usize,
    connect_timeout: Duration,
    resources: Option<Vec<Resource>>,
    treat_http_errors_as_failures: bool,
    snapshot_initial_delay: Duration,
    snapshot_period: Duration,
    listeners: Listeners,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            users: 1,
            iterations_per_user: 1,
            warmup_iterations_per_user: 0,
            resource_rate: 0,
            run_for: None,
            host: "localhost".to_string(),
            port: 0,
            transport: None,
            selectors: 1,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            resources: None,
            treat_http_errors_as_failures: false,
            snapshot_initial_delay: Duration::ZERO,
            snapshot_period: DEFAULT_SNAPSHOT_PERIOD,
            listeners: Listeners::default(),
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of simulated users; one worker thread with its own client
    /// drives each of them.
    pub fn users(mut self, users: usize) -> Self {
        self.users = users;
        self
    }

    /// Measured iterations per user; zero iterates until interrupted.
    pub fn iterations_per_user(mut self, iterations: u64) -> Self {
        self.iterations_per_user = iterations;
        self
    }

    /// Unmeasured iterations each user runs before measurement starts.
    pub fn warmup_iterations_per_user(mut self, iterations: u64) -> Self {
        self.warmup_iterations_per_user = iterations;
        self
    }

    /// Engine-wide target rate in resources per second; zero disables
    /// pacing entirely.
    pub fn resource_rate(mut self, rate: u64) -> Self {
        self.resource_rate = rate;
        self
    }

    /// Interrupt the run once this much wall-clock time has elapsed.
    pub fn run_for(mut self, duration: Duration) -> Self {
        self.run_for = Some(duration);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Bound on concurrent connection establishment during startup.
    pub fn selectors(mut self, selectors: usize) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Append a resource tree to the profile. Without any, the profile is
    /// a single `GET /`.
    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.get_or_insert_with(Vec::new).push(resource);
        self
    }

    /// Replace the whole profile.
    pub fn resources(mut self, resources: Vec<Resource>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Count HTTP status >= 400 as request failures. Off by default:
    /// a served error page is still a served response.
    pub fn treat_http_errors_as_failures(mut self, enabled: bool) -> Self {
        self.treat_http_errors_as_failures = enabled;
        self
    }

    /// Initial delay and period of the interval-snapshot scheduler. Only
    /// relevant once a snapshot listener is installed.
    pub fn snapshot_schedule(mut self, initial_delay: Duration, period: Duration) -> Self {
        self.snapshot_initial_delay = initial_delay;
        self.snapshot_period = period.max(Duration::from_millis(1));
        self
    }

    pub fn request_listener(mut self, listener: impl RequestListener) -> Self {
        self.listeners.request.push(Arc::new(listener));
        self
    }

    pub fn node_listener(mut self, listener: impl NodeListener) -> Self {
        self.listeners.node.push(Arc::new(listener));
        self
    }

    pub fn tree_listener(mut self, listener: impl TreeListener) -> Self {
        self.listeners.tree.push(Arc::new(listener));
        self
    }

    pub fn latency_listener(mut self, listener: impl LatencyListener) -> Self {
        self.listeners.latency.push(Arc::new(listener));
        self
    }

    pub fn response_time_listener(mut self, listener: impl ResponseTimeListener) -> Self {
        self.listeners.response_time.push(Arc::new(listener));
        self
    }

    pub fn snapshot_listener(mut self, listener: impl SnapshotListener) -> Self {
        self.listeners.snapshot.push(Arc::new(listener));
        self
    }

    /// Validate the configuration and assemble the generator. Nothing is
    /// connected or spawned yet; that happens on `begin`.
    pub fn build(self) -> Result<LoadGenerator, ConfigError> {
        if self.users < 1 {
            return Err(ConfigError::NoUsers);
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.port < 1 {
            return Err(ConfigError::InvalidPort);
        }
        let resources = self
            .resources
            .unwrap_or_else(|| vec![Resource::new("/")]);
        if resources.is_empty() {
            return Err(ConfigError::NoResources);
        }
        let transport = self.transport.ok_or(ConfigError::NoTransport)?;

        for root in &resources {
            validate_paths(root, transport.scheme(), &self.host, self.port)?;
        }

        let config = Config {
            users: self.users,
            iterations_per_user: self.iterations_per_user,
            warmup_iterations_per_user: self.warmup_iterations_per_user,
            resource_rate: self.resource_rate,
            run_for: self.run_for,
            host: self.host,
            port: self.port,
            transport,
            selectors: self.selectors.max(1),
            connect_timeout: self.connect_timeout,
            resources: resources.into_iter().map(Arc::new).collect(),
            treat_http_errors_as_failures: self.treat_http_errors_as_failures,
            snapshot_initial_delay: self.snapshot_initial_delay,
            snapshot_period: self.snapshot_period,
        };

        Ok(LoadGenerator::new(config, self.listeners))
    }
}

/// Every path in the subtree must form a parseable request target against
/// the configured origin, so the hot path never builds an invalid request.
fn validate_paths(
    root: &Resource,
    scheme: &str,
    host: &str,
    port: u16,
) -> Result<(), ConfigError> {
    let mut invalid = None;
    root.walk(&mut |resource| {
        if let Some(path) = resource.path() {
            let url = format!("{scheme}://{host}:{port}{path}");
            if url.parse::<Uri>().is_err() && invalid.is_none() {
                invalid = Some(path.to_string());
            }
        }
    });
    match invalid {
        Some(path) => Err(ConfigError::InvalidResourcePath(path)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Builder {
        Builder::new().port(8080).transport(Transport::Http1)
    }

    #[test]
    fn default_profile_is_one_get_root() {
        let generator = valid().build().unwrap();
        assert_eq!(generator.resources_per_iteration(), 1);
    }

    #[test]
    fn users_must_be_positive() {
        assert!(matches!(
            valid().users(0).build(),
            Err(ConfigError::NoUsers)
        ));
    }

    #[test]
    fn host_must_not_be_blank() {
        assert!(matches!(
            valid().host("  ").build(),
            Err(ConfigError::MissingHost)
        ));
    }

    #[test]
    fn port_must_be_positive() {
        assert!(matches!(
            Builder::new().transport(Transport::Http1).build(),
            Err(ConfigError::InvalidPort)
        ));
    }

    #[test]
    fn profile_must_not_be_empty() {
        assert!(matches!(
            valid().resources(Vec::new()).build(),
            Err(ConfigError::NoResources)
        ));
    }

    #[test]
    fn transport_is_mandatory() {
        assert!(matches!(
            Builder::new().port(8080).build(),
            Err(ConfigError::NoTransport)
        ));
    }

    #[test]
    fn resource_paths_are_checked_up_front() {
        let result = valid()
            .resource(Resource::new("/ok").child(Resource::new("no leading slash")))
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidResourcePath(path)) if path == "no leading slash"
        ));
    }
}
