// ABOUTME: Worker pool owning N supervised worker processes and their message channels
// ABOUTME: A dedicated pool thread runs the actor; callers talk to it over a command channel

//! Worker pool.
//!
//! # Architecture
//!
//! ```text
//!  caller threads                      pool thread ("worker-pool")
//! ┌──────────────┐   PoolCommand    ┌──────────────────────────────────────┐
//! │ WorkerPool   │ ───────────────▶ │ PoolActor                            │
//! │  send()      │                  │  slots[i]: process + endpoint/Handler│
//! │  shutdown()  │ ◀─── Reply ───── │  queue: requests waiting for a worker│
//! └──────────────┘                  │  cursor: round-robin position        │
//!                                   └──────────────────────────────────────┘
//!                                     ▲ SlotEvent (connected / closed /
//!                                     │ exited / restart due)
//!                                   watcher, accept and Handler tasks
//! ```
//!
//! All slot state lives inside the actor task, so nothing here is locked.
//! Late events from a replaced worker are recognised by the slot generation
//! and ignored.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::PoolConfig;
use super::endpoint::{EndpointDir, EndpointError};
use super::handler::{CloseReason, Handler};
use super::metrics::{MetricsSnapshot, PoolMetrics};
use super::process_supervisor::{
    resolve_executable, ExponentialBackoff, ProcessExit, StopMode, WorkerProcess,
};
use super::reply::{self, Reply, ReplyCompleter, ReplyError};

/// Interval at which queued requests are checked against their deadline
const QUEUE_TICK: Duration = Duration::from_millis(100);

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 64;

// === Pool Errors ===

/// Errors that can occur while starting a pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not create the endpoint directory
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Could not start the pool thread or its runtime
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The pool thread exited before reporting readiness
    #[error("Pool thread exited during startup")]
    ThreadExited,
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

// === Events and status ===

/// Notifications published by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A worker connected back to its endpoint and is ready for requests
    WorkerConnected {
        /// Slot index
        slot: usize,
    },

    /// A worker ended unexpectedly and will be respawned after `delay`
    WorkerRestarting {
        /// Slot index
        slot: usize,
        /// How the previous process ended
        reason: String,
        /// Backoff before the respawn
        delay: Duration,
    },

    /// A worker executable could not be started. Published at most once per pool.
    FailedToStart {
        /// First slot that failed
        slot: usize,
        /// Spawn error
        error: String,
    },
}

/// Why a slot is not running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathCause {
    /// The executable could not be started; the slot is never retried
    FailedToStart,
    /// Crashed or exited; a respawn is scheduled
    Other,
}

/// Lifecycle state of one worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Being (re)started
    Starting,
    /// Process running, waiting for it to connect
    Listening,
    /// Connected and accepting requests
    Connected,
    /// Not running
    Dead(DeathCause),
}

/// Snapshot of one worker slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    /// Slot index
    pub index: usize,
    /// Current state
    pub state: SlotState,
    /// Worker process id, if a process is running
    pub pid: Option<u32>,
    /// Respawns since the pool started
    pub restarts: u32,
    /// Requests written to this worker and not yet answered
    pub pending: usize,
}

// === Commands ===

enum PoolCommand {
    Send {
        payload: Vec<u8>,
        completer: ReplyCompleter,
    },
    Snapshot {
        respond: oneshot::Sender<Vec<SlotStatus>>,
    },
    Shutdown,
}

/// Reports from tasks owned by the actor, tagged with the slot generation
#[derive(Debug)]
enum SlotEvent {
    Accepted {
        slot: usize,
        generation: u64,
        stream: std::io::Result<UnixStream>,
    },
    HandlerClosed {
        slot: usize,
        generation: u64,
        reason: CloseReason,
    },
    Exited {
        slot: usize,
        generation: u64,
        exit: ProcessExit,
    },
    RestartDue {
        slot: usize,
        generation: u64,
    },
}

// === Builder ===

/// Configures a pool before it starts.
///
/// Configuration is fixed once [`WorkerPoolBuilder::start`] consumes the builder.
#[derive(Debug)]
pub struct WorkerPoolBuilder {
    config: PoolConfig,
    events: broadcast::Sender<PoolEvent>,
}

impl WorkerPoolBuilder {
    /// Builder for a pool running `config.executable`
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { config, events }
    }

    /// Configuration the pool will start with
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Receive pool events, including those published during startup.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Start the pool thread and spawn every worker.
    ///
    /// Returns once the pool thread is running; workers connect in the
    /// background and requests sent before then are queued.
    pub fn start(self) -> PoolResult<WorkerPool> {
        self.config.validate().map_err(PoolError::Config)?;

        let Self { config, events } = self;
        let metrics = Arc::new(PoolMetrics::new());
        let (commands, command_rx) = mpsc::unbounded_channel();
        // start() may be called from async code, where tokio's blocking_recv panics
        let (ready_tx, ready_rx) = std_mpsc::channel::<PoolResult<Handle>>();

        let worker_count = config.worker_count;
        let actor_events = events.clone();
        let actor_metrics = Arc::clone(&metrics);

        let thread = std::thread::Builder::new()
            .name("worker-pool".to_string())
            .spawn(move || {
                reply::mark_pool_thread();

                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(PoolError::Io(e)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let actor = match PoolActor::new(config, command_rx, actor_events, actor_metrics) {
                        Ok(actor) => actor,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(Handle::current()));
                    actor.run().await;
                });
            })?;

        let runtime = match ready_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(PoolError::ThreadExited);
            }
        };

        Ok(WorkerPool {
            commands,
            events,
            metrics,
            runtime,
            worker_count,
            thread: Mutex::new(Some(thread)),
        })
    }
}

// === Pool handle ===

/// Handle to a running worker pool. Safe to share between threads.
///
/// Dropping the handle shuts the pool down.
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    events: broadcast::Sender<PoolEvent>,
    metrics: Arc<PoolMetrics>,
    runtime: Handle,
    worker_count: usize,
    thread: Mutex<Option<ThreadHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Shorthand for `WorkerPoolBuilder::new(config).start()`
    pub fn start(config: PoolConfig) -> PoolResult<Self> {
        WorkerPoolBuilder::new(config).start()
    }

    /// Send a request to the next connected worker.
    ///
    /// Never blocks. If no worker is connected the request waits up to the
    /// configured dispatch timeout.
    pub fn send(&self, payload: Vec<u8>) -> Reply {
        let (reply, completer) = reply::channel();
        self.metrics.request_sent();

        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(PoolCommand::Send { payload, completer })
        {
            if let PoolCommand::Send { completer, .. } = command {
                completer.fail(ReplyError::PoolShutDown);
            }
        }
        reply
    }

    /// Snapshot of every worker slot. Empty once the pool has shut down.
    pub async fn slot_statuses(&self) -> Vec<SlotStatus> {
        let (respond, response) = oneshot::channel();
        if self.commands.send(PoolCommand::Snapshot { respond }).is_err() {
            return vec![];
        }
        response.await.unwrap_or_default()
    }

    /// Receive subsequent pool events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Number of worker slots
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Current counters
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runtime of the pool thread, for work that must run next to the workers
    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Whether the pool thread has stopped
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.commands.is_closed()
    }

    /// Stop every worker and the pool thread.
    ///
    /// Queued requests fail with [`ReplyError::PoolShutDown`], sockets are
    /// closed, and each worker gets the grace period to exit before it is
    /// terminated. Blocks until the pool thread has exited, unless called
    /// from the pool thread itself.
    pub fn shutdown(&self) {
        let _ = self.commands.send(PoolCommand::Shutdown);

        if reply::is_pool_thread() {
            return;
        }

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Worker pool thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// === Actor ===

struct Queued {
    payload: Vec<u8>,
    completer: ReplyCompleter,
    deadline: Instant,
}

struct Slot {
    index: usize,
    generation: u64,
    state: SlotState,
    process: Option<WorkerProcess>,
    handler: Option<Handler>,
    accept_task: Option<JoinHandle<()>>,
    backoff: ExponentialBackoff,
    restarts: u32,
}

impl Slot {
    fn is_ready(&self) -> bool {
        self.state == SlotState::Connected && self.handler.as_ref().is_some_and(|h| !h.is_closed())
    }

    /// Drop the Handler and accept task, and ask any process to stop.
    fn tear_down(&mut self, grace: Duration) {
        self.handler = None;
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(mut process) = self.process.take() {
            process.stop(StopMode::Terminate { grace });
        }
    }

    fn status(&self) -> SlotStatus {
        SlotStatus {
            index: self.index,
            state: self.state,
            pid: self.process.as_ref().map(WorkerProcess::pid),
            restarts: self.restarts,
            pending: self.handler.as_ref().map_or(0, Handler::pending_count),
        }
    }
}

struct PoolActor {
    config: PoolConfig,
    executable: PathBuf,
    endpoints: EndpointDir,
    slots: Vec<Slot>,
    cursor: Option<usize>,
    queue: VecDeque<Queued>,
    failed_to_start_reported: bool,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    slot_tx: mpsc::UnboundedSender<SlotEvent>,
    slot_rx: mpsc::UnboundedReceiver<SlotEvent>,
    events: broadcast::Sender<PoolEvent>,
    metrics: Arc<PoolMetrics>,
}

impl PoolActor {
    fn new(
        config: PoolConfig,
        commands: mpsc::UnboundedReceiver<PoolCommand>,
        events: broadcast::Sender<PoolEvent>,
        metrics: Arc<PoolMetrics>,
    ) -> PoolResult<Self> {
        let executable = resolve_executable(&config.executable, &config.search_dirs);
        let endpoints = EndpointDir::new(&config.endpoint_prefix)?;
        let (slot_tx, slot_rx) = mpsc::unbounded_channel();

        let slots = (0..config.worker_count)
            .map(|index| Slot {
                index,
                generation: 0,
                state: SlotState::Starting,
                process: None,
                handler: None,
                accept_task: None,
                backoff: ExponentialBackoff::new(config.restart_backoff_base, config.restart_backoff_max),
                restarts: 0,
            })
            .collect();

        info!(
            executable = %executable.display(),
            workers = config.worker_count,
            endpoint_dir = %endpoints.path().display(),
            "Starting worker pool"
        );

        Ok(Self {
            config,
            executable,
            endpoints,
            slots,
            cursor: None,
            queue: VecDeque::new(),
            failed_to_start_reported: false,
            commands,
            slot_tx,
            slot_rx,
            events,
            metrics,
        })
    }

    async fn run(mut self) {
        for index in 0..self.slots.len() {
            self.start_worker(index);
        }

        let mut tick = tokio::time::interval(QUEUE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PoolCommand::Send { payload, completer }) => self.route(payload, completer),
                    Some(PoolCommand::Snapshot { respond }) => {
                        let _ = respond.send(self.statuses());
                    }
                    Some(PoolCommand::Shutdown) | None => break,
                },

                Some(event) = self.slot_rx.recv() => self.on_slot_event(event),

                _ = tick.tick(), if !self.queue.is_empty() => self.expire_queued(),
            }
        }

        self.shutdown().await;
    }

    // --- Worker lifecycle ---

    fn start_worker(&mut self, index: usize) {
        let grace = self.config.shutdown_grace;
        let slot = &mut self.slots[index];
        slot.tear_down(grace);
        slot.generation += 1;
        slot.state = SlotState::Starting;
        let generation = slot.generation;

        let endpoint = match self.endpoints.bind() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(slot = index, error = %e, "Failed to create worker endpoint");
                self.schedule_restart(index, format!("endpoint error: {e}"));
                return;
            }
        };

        let exit_tx = self.slot_tx.clone();
        let spawned = WorkerProcess::spawn(
            &self.executable,
            endpoint.address(),
            &self.config.worker_env,
            move |exit| {
                let _ = exit_tx.send(SlotEvent::Exited {
                    slot: index,
                    generation,
                    exit,
                });
            },
        );

        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                self.on_failed_to_start(index, &e.to_string());
                return;
            }
        };

        debug!(slot = index, pid = process.pid(), endpoint = %endpoint.address().display(), "Waiting for worker to connect");

        let accept_tx = self.slot_tx.clone();
        let accept_task = tokio::spawn(async move {
            let stream = endpoint.accept_one().await;
            let _ = accept_tx.send(SlotEvent::Accepted {
                slot: index,
                generation,
                stream,
            });
        });

        let slot = &mut self.slots[index];
        slot.process = Some(process);
        slot.accept_task = Some(accept_task);
        slot.state = SlotState::Listening;
    }

    fn on_failed_to_start(&mut self, index: usize, error: &str) {
        self.slots[index].state = SlotState::Dead(DeathCause::FailedToStart);
        self.metrics.spawn_failed();
        error!(slot = index, executable = %self.executable.display(), error = %error, "Worker failed to start");

        if !self.failed_to_start_reported {
            self.failed_to_start_reported = true;
            let _ = self.events.send(PoolEvent::FailedToStart {
                slot: index,
                error: error.to_string(),
            });
        }

        if self.all_failed_to_start() {
            let count = self.fail_queue(&ReplyError::PoolUnavailable);
            if count > 0 {
                warn!(count, "No worker can start, failed queued requests");
            }
        }
    }

    fn schedule_restart(&mut self, index: usize, reason: String) {
        let slot = &mut self.slots[index];
        slot.state = SlotState::Dead(DeathCause::Other);
        slot.restarts = slot.restarts.saturating_add(1);
        let delay = slot.backoff.next_delay();
        let generation = slot.generation;
        self.metrics.worker_restarted();
        self.update_connected();

        warn!(slot = index, reason = %reason, delay_ms = delay.as_millis(), "Restarting worker");
        let _ = self.events.send(PoolEvent::WorkerRestarting {
            slot: index,
            reason,
            delay,
        });

        let tx = self.slot_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SlotEvent::RestartDue {
                slot: index,
                generation,
            });
        });
    }

    fn on_slot_event(&mut self, event: SlotEvent) {
        let (index, generation) = match &event {
            SlotEvent::Accepted { slot, generation, .. }
            | SlotEvent::HandlerClosed { slot, generation, .. }
            | SlotEvent::Exited { slot, generation, .. }
            | SlotEvent::RestartDue { slot, generation } => (*slot, *generation),
        };

        if self.slots.get(index).map(|s| s.generation) != Some(generation) {
            debug!(slot = index, generation, "Ignoring event from a replaced worker");
            return;
        }

        match event {
            SlotEvent::Accepted { stream, .. } => self.on_accepted(index, generation, stream),
            SlotEvent::HandlerClosed { reason, .. } => self.on_handler_closed(index, &reason),
            SlotEvent::Exited { exit, .. } => {
                let slot = &mut self.slots[index];
                // The watcher has already reaped the process
                slot.process = None;
                slot.tear_down(self.config.shutdown_grace);
                self.schedule_restart(index, exit.to_string());
            }
            SlotEvent::RestartDue { .. } => {
                if self.slots[index].state == SlotState::Dead(DeathCause::Other) {
                    self.start_worker(index);
                }
            }
        }
    }

    fn on_accepted(&mut self, index: usize, generation: u64, stream: std::io::Result<UnixStream>) {
        let grace = self.config.shutdown_grace;
        let slot = &mut self.slots[index];
        slot.accept_task = None;

        // The process may have exited before its connection was seen
        if slot.state != SlotState::Listening || slot.process.is_none() {
            debug!(slot = index, state = ?slot.state, "Dropping connection from a worker that is gone");
            return;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(slot = index, error = %e, "Accepting worker connection failed");
                if let Some(process) = slot.process.as_mut() {
                    process.stop(StopMode::Terminate { grace });
                }
                return;
            }
        };

        let close_tx = self.slot_tx.clone();
        let handler = Handler::spawn(stream, format!("slot-{index}"), self.config.max_frame_len, move |reason| {
            let _ = close_tx.send(SlotEvent::HandlerClosed {
                slot: index,
                generation,
                reason,
            });
        });

        slot.handler = Some(handler);
        slot.state = SlotState::Connected;
        slot.backoff.reset();
        let pid = slot.process.as_ref().map(WorkerProcess::pid);

        info!(slot = index, pid = ?pid, "Worker connected");
        self.update_connected();
        let _ = self.events.send(PoolEvent::WorkerConnected { slot: index });

        self.flush_queue();
    }

    fn on_handler_closed(&mut self, index: usize, reason: &CloseReason) {
        let grace = self.config.shutdown_grace;
        let slot = &mut self.slots[index];
        slot.handler = None;

        // The process is still running but unreachable; its exit triggers the respawn
        if let Some(process) = slot.process.as_mut() {
            warn!(slot = index, pid = process.pid(), reason = ?reason, "Worker connection closed, terminating worker");
            process.stop(StopMode::Terminate { grace });
        }
        self.update_connected();
    }

    // --- Dispatch ---

    fn route(&mut self, payload: Vec<u8>, completer: ReplyCompleter) {
        if self.all_failed_to_start() {
            completer.fail(ReplyError::PoolUnavailable);
            return;
        }

        if let Err((payload, completer)) = self.try_dispatch(payload, completer) {
            let deadline = Instant::now() + self.config.dispatch_timeout;
            self.queue.push_back(Queued {
                payload,
                completer,
                deadline,
            });
            self.metrics.set_queued(self.queue.len());
            debug!(queued = self.queue.len(), "No worker connected, request queued");
        }
    }

    /// Hand the request to the next ready Handler, or give it back.
    fn try_dispatch(
        &mut self,
        mut payload: Vec<u8>,
        mut completer: ReplyCompleter,
    ) -> Result<(), (Vec<u8>, ReplyCompleter)> {
        for _ in 0..self.slots.len() {
            let ready: Vec<bool> = self.slots.iter().map(Slot::is_ready).collect();
            let Some(index) = next_ready(&ready, self.cursor) else {
                break;
            };
            self.cursor = Some(index);

            let Some(handler) = self.slots[index].handler.as_ref() else {
                continue;
            };
            match handler.dispatch(payload, completer) {
                Ok(id) => {
                    debug!(slot = index, worker = handler.name(), id, "Request dispatched");
                    return Ok(());
                }
                Err(returned) => (payload, completer) = returned,
            }
        }
        Err((payload, completer))
    }

    fn flush_queue(&mut self) {
        let now = Instant::now();
        let mut expired = 0u64;

        while let Some(queued) = self.queue.pop_front() {
            if queued.deadline <= now {
                queued.completer.fail(ReplyError::PoolUnavailable);
                expired += 1;
                continue;
            }
            if let Err((payload, completer)) = self.try_dispatch(queued.payload, queued.completer) {
                self.queue.push_front(Queued {
                    payload,
                    completer,
                    deadline: queued.deadline,
                });
                break;
            }
        }

        self.metrics.requests_expired(expired);
        self.metrics.set_queued(self.queue.len());
    }

    fn expire_queued(&mut self) {
        let now = Instant::now();
        let mut expired = 0u64;

        // Deadlines are monotonic in queue order
        while self.queue.front().is_some_and(|q| q.deadline <= now) {
            if let Some(queued) = self.queue.pop_front() {
                queued.completer.fail(ReplyError::PoolUnavailable);
                expired += 1;
            }
        }

        if expired > 0 {
            warn!(expired, "Requests timed out waiting for a worker");
            self.metrics.requests_expired(expired);
            self.metrics.set_queued(self.queue.len());
        }
    }

    fn fail_queue(&mut self, error: &ReplyError) -> usize {
        let count = self.queue.len();
        for queued in self.queue.drain(..) {
            queued.completer.fail(error.clone());
        }
        self.metrics.set_queued(0);
        count
    }

    // --- Helpers ---

    fn all_failed_to_start(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.state == SlotState::Dead(DeathCause::FailedToStart))
    }

    fn update_connected(&self) {
        let connected = self.slots.iter().filter(|s| s.state == SlotState::Connected && s.handler.is_some()).count();
        self.metrics.set_connected(connected);
    }

    fn statuses(&self) -> Vec<SlotStatus> {
        self.slots.iter().map(Slot::status).collect()
    }

    async fn shutdown(&mut self) {
        info!("Shutting down worker pool");

        // Anything that raced the shutdown command fails too
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                PoolCommand::Send { completer, .. } => {
                    completer.fail(ReplyError::PoolShutDown);
                }
                PoolCommand::Snapshot { respond } => {
                    let _ = respond.send(self.statuses());
                }
                PoolCommand::Shutdown => {}
            }
        }

        let failed = self.fail_queue(&ReplyError::PoolShutDown);
        if failed > 0 {
            info!(failed, "Failed queued requests on shutdown");
        }

        let grace = self.config.shutdown_grace;
        let mut stopping = Vec::new();
        for slot in &mut self.slots {
            // Bumping the generation silences events from the old tasks
            slot.generation += 1;
            slot.handler = None;
            if let Some(task) = slot.accept_task.take() {
                task.abort();
            }
            if let Some(process) = slot.process.take() {
                let index = slot.index;
                stopping.push(async move {
                    let exit = process.stop_and_wait(StopMode::Shutdown { grace }).await;
                    debug!(slot = index, exit = %exit, "Worker stopped");
                });
            }
            slot.state = SlotState::Dead(DeathCause::Other);
        }

        futures_util::future::join_all(stopping).await;
        self.metrics.set_connected(0);
        info!("Worker pool shut down");
    }
}

/// Next ready slot strictly after `last`, wrapping around.
///
/// With no previous choice the search starts at slot 0.
pub(crate) fn next_ready(ready: &[bool], last: Option<usize>) -> Option<usize> {
    let len = ready.len();
    if len == 0 {
        return None;
    }
    let start = last.map_or(0, |last| (last + 1) % len);
    (0..len).map(|offset| (start + offset) % len).find(|&i| ready[i])
}
