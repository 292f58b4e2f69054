mod runner;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flume::{Receiver, Sender};

pub(crate) use self::runner::ShutdownHandle;
use self::runner::{Runner, RunnerContext, RunnerReport};
use crate::builder::{Builder, Config};
use crate::client::{Connector, StartError};
use crate::handler::{guarded, ResultHandler};
use crate::listener::Listeners;

/// A run failed to complete naturally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A run is already active on this generator.
    #[error("a run is already in progress")]
    AlreadyRunning,
    /// No client could be started; nothing was measured.
    #[error("failed to start the client transport: {0}")]
    TransportStart(#[from] StartError),
    /// The run was cancelled by `interrupt` or a `run_for` bound. This is
    /// the expected outcome of both.
    #[error("the run was interrupted")]
    Interrupted,
}

/// Engine lifecycle. Transitions are monotonic within a run; `Stopped` is
/// terminal per run but the generator is reusable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Configured = 0,
    Started = 1,
    Warming = 2,
    Running = 3,
    Interrupting = 4,
    Stopped = 5,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Configured,
            1 => State::Started,
            2 => State::Warming,
            3 => State::Running,
            4 => State::Interrupting,
            _ => State::Stopped,
        }
    }
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(State::Configured as u8))
    }

    pub(crate) fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Shared progress of one run: flips the engine to `Running` once the last
/// worker leaves warmup.
pub(crate) struct RunState {
    state: Arc<StateCell>,
    warming: AtomicUsize,
}

impl RunState {
    fn new(state: Arc<StateCell>, workers: usize) -> Self {
        Self {
            state,
            warming: AtomicUsize::new(workers),
        }
    }

    pub(crate) fn note_warmup_complete(&self) {
        if self.warming.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.set(State::Running);
        }
    }
}

/// The load-generation engine.
///
/// Owns the configuration and observers; each `begin` spawns a fresh set
/// of workers, statistics recorders and scheduler, and returns a future
/// that completes when the run does. The generator is reusable: a later
/// `begin` after completion starts a clean run over the same profile.
pub struct LoadGenerator {
    config: Arc<Config>,
    listeners: Arc<Listeners>,
    state: Arc<StateCell>,
    active: Arc<AtomicBool>,
    current: Arc<Mutex<Option<ShutdownHandle>>>,
}

impl LoadGenerator {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn new(config: Config, listeners: Listeners) -> Self {
        Self {
            config: Arc::new(config),
            listeners: Arc::new(listeners),
            state: Arc::new(StateCell::new()),
            active: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Requests issued by one full iteration over the profile.
    pub fn resources_per_iteration(&self) -> usize {
        self.config.resources_per_iteration()
    }

    /// Start a run and return its completion future.
    ///
    /// Workers are spawned immediately; the future only observes them.
    /// It resolves `Ok` when the iteration bound is reached, and with
    /// [`Error::Interrupted`] after an interrupt or an elapsed `run_for`.
    pub fn begin(&self) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        self.begin_with_limit(self.config.run_for)
    }

    /// Start a run that is interrupted once `limit` has elapsed, unless
    /// its iterations finish first.
    pub fn run_for(
        &self,
        limit: Duration,
    ) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        self.begin_with_limit(Some(limit))
    }

    /// Request cancellation of the active run, if any. Workers observe the
    /// flag at their next check; in-flight requests are drained, not
    /// abandoned.
    pub fn interrupt(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(stop) = current.as_ref() {
            info!("interrupt requested");
            self.state.set(State::Interrupting);
            stop.interrupt();
        }
    }

    fn begin_with_limit(
        &self,
        limit: Option<Duration>,
    ) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        let run = self.start_run(limit);
        async move { run?.drive().await }
    }

    /// Synchronous prologue of a run: guard, spawn workers and scheduler.
    fn start_run(&self, limit: Option<Duration>) -> Result<ActiveRun, Error> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        self.state.set(State::Started);
        let stop = ShutdownHandle::default();
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(stop.clone());

        let connector = match Connector::new(
            self.config.transport,
            &self.config.host,
            self.config.port,
            self.config.connect_timeout,
        ) {
            Ok(connector) => connector,
            Err(e) => {
                self.release();
                return Err(Error::TransportStart(e));
            }
        };

        info!(
            users = self.config.users,
            transport = ?self.config.transport,
            host = %self.config.host,
            port = self.config.port,
            resource_rate = self.config.resource_rate,
            "starting run"
        );

        let handler = Arc::new(ResultHandler::new(
            self.listeners.clone(),
            self.config.treat_http_errors_as_failures,
        ));
        handler.set_recording(true);

        let run_state = Arc::new(RunState::new(self.state.clone(), self.config.users));
        let (guard, waiter) = flume::bounded(1);
        let (results_tx, results) = flume::unbounded();

        for worker_id in 0..self.config.users {
            let context = RunnerContext {
                worker_id,
                config: self.config.clone(),
                handler: handler.clone(),
                stop: stop.clone(),
                connector: connector.clone(),
                run_state: run_state.clone(),
            };
            spawn_worker(context, guard.clone(), results_tx.clone());
        }
        drop(guard);
        drop(results_tx);

        self.state.set(if self.config.warmup_iterations_per_user > 0 {
            State::Warming
        } else {
            State::Running
        });

        let scheduler = if self.listeners.snapshot.is_empty() {
            None
        } else {
            Some(spawn_scheduler(
                handler.clone(),
                self.listeners.clone(),
                self.config.snapshot_initial_delay,
                self.config.snapshot_period,
            ))
        };

        Ok(ActiveRun {
            limit,
            stop,
            waiter,
            results,
            handler,
            scheduler,
            listeners: self.listeners.clone(),
            state: self.state.clone(),
            active: self.active.clone(),
            current: self.current.clone(),
        })
    }

    fn release(&self) {
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.state.set(State::Stopped);
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Everything one running instance of the engine owns until completion.
struct ActiveRun {
    limit: Option<Duration>,
    stop: ShutdownHandle,
    waiter: Receiver<()>,
    results: Receiver<Result<RunnerReport, StartError>>,
    handler: Arc<ResultHandler>,
    scheduler: Option<(Sender<()>, Receiver<()>)>,
    listeners: Arc<Listeners>,
    state: Arc<StateCell>,
    active: Arc<AtomicBool>,
    current: Arc<Mutex<Option<ShutdownHandle>>>,
}

impl ActiveRun {
    async fn drive(self) -> Result<(), Error> {
        if let Some(limit) = self.limit {
            tokio::select! {
                _ = self.waiter.recv_async() => {}
                _ = tokio::time::sleep(limit) => {
                    info!(limit = ?limit, "run duration elapsed, interrupting");
                    self.state.set(State::Interrupting);
                    self.stop.interrupt();
                    let _ = self.waiter.recv_async().await;
                }
            }
        } else {
            let _ = self.waiter.recv_async().await;
        }

        let mut transport_failure = None;
        while let Ok(result) = self.results.try_recv() {
            match result {
                Ok(report) => debug!(
                    worker_id = report.worker_id,
                    iterations = report.iterations,
                    "worker completed"
                ),
                Err(e) => transport_failure = Some(e),
            }
        }

        self.handler.set_recording(false);
        if let Some((scheduler_stop, scheduler_done)) = &self.scheduler {
            let _ = scheduler_stop.send(());
            let _ = scheduler_done.recv_async().await;
        }

        for listener in &self.listeners.latency {
            guarded(|| listener.on_generator_stop());
        }
        for listener in &self.listeners.response_time {
            guarded(|| listener.on_generator_stop());
        }
        for listener in &self.listeners.snapshot {
            guarded(|| listener.on_generator_stop());
        }

        let failed = self.handler.failed_requests();
        if failed > 0 {
            warn!(failed_requests = failed, "run saw failed requests");
        }

        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.state.set(State::Stopped);
        self.active.store(false, Ordering::SeqCst);
        info!("run finished");

        if let Some(e) = transport_failure {
            return Err(Error::TransportStart(e));
        }
        if self.stop.was_interrupted() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}

/// One dedicated thread per worker, each with its own single-threaded
/// runtime, so worker scheduling never interferes across users.
fn spawn_worker(
    context: RunnerContext,
    guard: Sender<()>,
    results: Sender<Result<RunnerReport, StartError>>,
) {
    let worker_id = context.worker_id;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("create worker runtime");

    std::thread::Builder::new()
        .name(format!("barrage-worker-{worker_id}"))
        .spawn(move || {
            debug!(worker_id, "spawning worker");
            let result = rt.block_on(Runner::run(context));
            let _ = results.send(result);

            // Dropping the guard last marks this worker as fully done.
            drop(guard);
            debug!(worker_id, "worker shut down");
        })
        .expect("spawn worker thread");
}

/// The scheduler thread ticks the interval snapshots for the installed
/// snapshot listeners and flushes one final snapshot at shutdown.
fn spawn_scheduler(
    handler: Arc<ResultHandler>,
    listeners: Arc<Listeners>,
    initial_delay: Duration,
    period: Duration,
) -> (Sender<()>, Receiver<()>) {
    let (stop_tx, stop_rx) = flume::bounded(1);
    let (done_tx, done_rx) = flume::bounded::<()>(1);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("create scheduler runtime");

    std::thread::Builder::new()
        .name("barrage-scheduler".to_string())
        .spawn(move || {
            rt.block_on(async move {
                let mut delay = initial_delay;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            let snapshot = handler.interval_snapshot();
                            for listener in &listeners.snapshot {
                                guarded(|| listener.on_interval(&snapshot));
                            }
                            delay = period;
                        }
                        _ = stop_rx.recv_async() => break,
                    }
                }

                // Final flush so the tail of the run is not lost.
                let snapshot = handler.interval_snapshot();
                for listener in &listeners.snapshot {
                    guarded(|| listener.on_interval(&snapshot));
                }
            });
            drop(done_tx);
        })
        .expect("spawn scheduler thread");

    (stop_tx, done_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_the_cell() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), State::Configured);
        for state in [
            State::Started,
            State::Warming,
            State::Running,
            State::Interrupting,
            State::Stopped,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn last_worker_out_of_warmup_flips_the_engine_to_running() {
        let cell = Arc::new(StateCell::new());
        cell.set(State::Warming);
        let run_state = RunState::new(cell.clone(), 2);

        run_state.note_warmup_complete();
        assert_eq!(cell.get(), State::Warming);
        run_state.note_warmup_complete();
        assert_eq!(cell.get(), State::Running);
    }
}
