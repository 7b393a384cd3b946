//! `Pool`: the scheduler that owns every worker and every pending task.
//! All mutable state lives behind a single control loop task reading a
//! `ControlMsg` channel — a conceptually single-threaded, cooperatively
//! scheduled core rendered as one Rust task rather than a mutex, owning
//! its own state machine without external locking.

use crate::channel::{ChannelEvent, ChannelEvents, WorkerChannel};
use crate::envelope::{Envelope, RemoteError, TaskId};
use crate::error::PoolError;
use crate::handle::TaskHandle;
use crate::task::{EventHandler, Task};
use crate::transfer::Transfer;
use crate::value::Value;
use crate::worker_handle::{WorkerHandle, WorkerId, WorkerState};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// How many workers the pool keeps alive even when idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinWorkers {
    Fixed(usize),
    /// Keep `maxWorkers` warm at all times; never reaps.
    Max,
}

impl Default for MinWorkers {
    fn default() -> Self {
        MinWorkers::Fixed(0)
    }
}

/// Passed to [`PoolConfig::on_create_worker`] before a worker is spawned.
pub struct WorkerCreateInfo {
    pub worker_id: WorkerId,
}

/// Passed to [`PoolConfig::on_terminate_worker`] once a worker is gone.
pub struct WorkerTerminateInfo {
    pub worker_id: WorkerId,
    pub graceful: bool,
}

/// Per-spawn overrides a [`PoolConfig::on_create_worker`] hook can hand
/// back to the factory to customize how one worker is spawned.
#[derive(Clone, Debug, Default)]
pub struct WorkerSpawnOverrides {
    pub env: Vec<(String, String)>,
    pub args: Vec<String>,
}

/// The only way the pool talks to the outside world to bring a worker
/// into existence — deliberately ignorant of *how*: the core never spawns
/// an OS resource itself.
///
/// Why: keeping the boundary here, rather than letting `Pool` know
/// about `std::process::Command` or any other concrete spawn mechanism,
/// is what lets `forgepool-process` exist as an independent crate and
/// what lets tests substitute an in-memory factory with zero special
/// casing in the scheduler.
///
/// What: one async method returning a channel pair; `overrides` comes
/// from [`PoolConfig::on_create_worker`], letting a caller customize a
/// specific spawn (extra env vars, extra args) without the factory
/// itself needing per-worker configuration state.
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    async fn spawn(
        &self,
        worker_id: WorkerId,
        overrides: WorkerSpawnOverrides,
    ) -> Result<(Arc<dyn WorkerChannel>, ChannelEvents), PoolError>;
}

/// Tunables for one [`Pool`].
///
/// Why: every fleet-shape decision — how many workers to keep warm, how
/// many a worker may run at once, how long a drain gets before it's
/// forced — is collected here rather than scattered across `Pool`
/// constructor arguments, so a caller builds one value and the pool's
/// constructor signature never has to grow.
///
/// What: a plain builder over fields with sane defaults in
/// [`PoolConfig::default`]; `max_workers` defaults to the host's
/// available parallelism minus one, leaving a core free for the caller.
///
/// Trade-offs: `on_create_worker`/`on_terminate_worker` are
/// `Arc<dyn Fn>` rather than generics so `PoolConfig` stays an ordinary
/// (non-generic) struct the rest of the crate can pass around freely.
pub struct PoolConfig {
    pub min_workers: MinWorkers,
    pub max_workers: usize,
    /// `0` means unbounded.
    pub max_queue_size: usize,
    pub worker_terminate_timeout: Duration,
    pub max_tasks_per_worker: usize,
    /// Reap an idle worker above `min_workers` after this much quiet time.
    pub idle_timeout: Option<Duration>,
    pub emit_std_streams: bool,
    pub on_create_worker: Option<Arc<dyn Fn(&WorkerCreateInfo) -> WorkerSpawnOverrides + Send + Sync>>,
    pub on_terminate_worker: Option<Arc<dyn Fn(&WorkerTerminateInfo) + Send + Sync>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);
        PoolConfig {
            min_workers: MinWorkers::Fixed(0),
            max_workers,
            max_queue_size: 0,
            worker_terminate_timeout: Duration::from_millis(1000),
            max_tasks_per_worker: 1,
            idle_timeout: None,
            emit_std_streams: false,
            on_create_worker: None,
            on_terminate_worker: None,
        }
    }
}

impl PoolConfig {
    pub fn with_min_workers(mut self, v: MinWorkers) -> Self {
        self.min_workers = v;
        self
    }

    pub fn with_max_workers(mut self, v: usize) -> Self {
        self.max_workers = v;
        self
    }

    pub fn with_max_queue_size(mut self, v: usize) -> Self {
        self.max_queue_size = v;
        self
    }

    pub fn with_worker_terminate_timeout(mut self, v: Duration) -> Self {
        self.worker_terminate_timeout = v;
        self
    }

    pub fn with_max_tasks_per_worker(mut self, v: usize) -> Self {
        self.max_tasks_per_worker = v.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, v: Option<Duration>) -> Self {
        self.idle_timeout = v;
        self
    }

    pub fn with_emit_std_streams(mut self, v: bool) -> Self {
        self.emit_std_streams = v;
        self
    }

    pub fn on_create_worker(
        mut self,
        f: impl Fn(&WorkerCreateInfo) -> WorkerSpawnOverrides + Send + Sync + 'static,
    ) -> Self {
        self.on_create_worker = Some(Arc::new(f));
        self
    }

    pub fn on_terminate_worker(
        mut self,
        f: impl Fn(&WorkerTerminateInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_terminate_worker = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("max_queue_size", &self.max_queue_size)
            .field("worker_terminate_timeout", &self.worker_terminate_timeout)
            .field("max_tasks_per_worker", &self.max_tasks_per_worker)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Snapshot returned by [`Pool::stats`].
///
/// What: a point-in-time copy of the control loop's own counters —
/// there is no live reference a caller could hold onto, since all of
/// this state lives inside the single task `PoolState::run` owns.
/// `transfer_degraded` and `swallowed_errors` are cumulative since
/// `Pool::new`; everything else is instantaneous.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub pending_tasks: usize,
    pub active_tasks: usize,
    pub transfer_degraded: u64,
    pub swallowed_errors: u64,
}

/// Per-call overrides to [`Pool::exec`].
///
/// What: everything here is optional and defaults to "no override" —
/// `ExecOptions::default()` is the common case for a call with no
/// streaming events, no transfers, and no per-call timeout.
pub struct ExecOptions {
    pub on: Option<EventHandler>,
    /// Binary regions the caller is handing over; wrapped in [`Transfer`]
    /// rather than a raw [`Bytes`] so callers flag move-intent explicitly
    /// at the call site, mirroring `Transfer(payload, regions)`.
    pub transfer: Vec<Transfer>,
    pub timeout: Option<Duration>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        ExecOptions {
            on: None,
            transfer: Vec::new(),
            timeout: None,
        }
    }
}

#[derive(Clone, Copy)]
enum CancelReason {
    User,
    Timeout(Duration),
}

pub(crate) enum ControlMsg {
    Exec {
        task: Task,
        respond: oneshot::Sender<Result<(), PoolError>>,
    },
    Cancel(TaskId),
    SetTimeout {
        id: TaskId,
        deadline: Instant,
    },
    TaskTimeoutFired {
        id: TaskId,
        deadline: Instant,
    },
    AbortTimeoutFired {
        worker_id: WorkerId,
        task_id: TaskId,
    },
    WorkerEvent {
        worker_id: WorkerId,
        event: ChannelEvent,
    },
    WorkerSpawned {
        worker_id: WorkerId,
        result: Result<(Arc<dyn WorkerChannel>, ChannelEvents), PoolError>,
    },
    IdleTimeoutFired {
        worker_id: WorkerId,
        generation: u64,
    },
    DrainTimeoutFired,
    TerminateTimeoutFired {
        worker_id: WorkerId,
    },
    Stats(oneshot::Sender<PoolStats>),
    Terminate {
        force: bool,
        timeout: Option<Duration>,
        respond: oneshot::Sender<()>,
    },
}

struct PoolInner {
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    next_task_id: AtomicU64,
    terminated: AtomicBool,
}

/// A handle to a running worker pool. Cheap to clone; every clone shares
/// the same control loop task.
///
/// Why: callers need a value they can hand to many concurrent tasks
/// without synchronizing among themselves — `Pool` is that value. All
/// the actual synchronization happens once, inside the [`PoolState`]
/// control loop this handle's `control_tx` feeds.
///
/// What: three cheap, `Arc`-shared fields — the channel into the
/// control loop, the monotonic task-id counter, and a termination flag
/// checked synchronously so `exec` can short-circuit without a round
/// trip once `terminate` has been called.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(factory: Arc<dyn WorkerFactory>, config: PoolConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            control_tx: control_tx.clone(),
            next_task_id: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
        });
        let state = PoolState::new(factory, config, control_tx);
        tokio::spawn(state.run(control_rx));
        Pool { inner }
    }

    /// Submits one call. Resolves once the pool has accepted or
    /// synchronously rejected the task; the returned handle then settles
    /// independently when the call itself finishes.
    pub async fn exec(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
        opts: ExecOptions,
    ) -> Result<TaskHandle, PoolError> {
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(PoolError::PoolTerminated);
        }
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (resolve_tx, resolve_rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let timeout_deadline = opts.timeout.map(|d| Instant::now() + d);
        let transfer: Vec<Bytes> = opts.transfer.into_iter().map(Transfer::into_inner).collect();
        let task = Task::new(
            id,
            method.into(),
            args,
            transfer,
            opts.on,
            timeout_deadline,
            cancelled.clone(),
            resolve_tx,
        );
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .control_tx
            .send(ControlMsg::Exec {
                task,
                respond: ack_tx,
            })
            .map_err(|_| PoolError::PoolTerminated)?;
        ack_rx.await.map_err(|_| PoolError::PoolTerminated)??;
        Ok(TaskHandle::new(
            id,
            resolve_rx,
            self.inner.control_tx.clone(),
            cancelled,
        ))
    }

    pub async fn stats(&self) -> PoolStats {
        let (tx, rx) = oneshot::channel();
        if self.inner.control_tx.send(ControlMsg::Stats(tx)).is_err() {
            return PoolStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Graceful by default; force-kills every worker immediately when
    /// `force` is true. Resolves once every worker is gone.
    ///
    /// How: sets the `terminated` flag synchronously so any `exec`
    /// racing this call is rejected up front, then asks the control
    /// loop to drain every worker (each runs its `__cleanup__` hook
    /// before its `TERMINATE_ACK`) within `timeout`, falling back to
    /// `PoolConfig::worker_terminate_timeout` when `timeout` is `None`.
    pub async fn terminate(&self, force: bool, timeout: Option<Duration>) {
        self.inner.terminated.store(true, Ordering::Release);
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .control_tx
            .send(ControlMsg::Terminate {
                force,
                timeout,
                respond: tx,
            })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

fn spawn_event_forwarder(
    worker_id: WorkerId,
    mut events: ChannelEvents,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if control_tx
                .send(ControlMsg::WorkerEvent { worker_id, event })
                .is_err()
            {
                break;
            }
        }
    });
}

/// Everything the control loop owns exclusively. Never shared; never
/// locked.
struct PoolState {
    factory: Arc<dyn WorkerFactory>,
    config: PoolConfig,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    workers: Vec<WorkerHandle>,
    /// Workers whose `WorkerFactory::spawn` future hasn't resolved yet,
    /// keyed by the id reserved for them up front, with the task (if
    /// any) they were spawned to serve.
    booting: HashMap<WorkerId, Option<Task>>,
    queue: VecDeque<Task>,
    next_worker_id: WorkerId,
    terminated: bool,
    aborting: HashMap<TaskId, CancelReason>,
    terminate_respond: Vec<oneshot::Sender<()>>,
    stats_transfer_degraded: u64,
    stats_swallowed_errors: u64,
}

impl PoolState {
    fn new(
        factory: Arc<dyn WorkerFactory>,
        config: PoolConfig,
        control_tx: mpsc::UnboundedSender<ControlMsg>,
    ) -> Self {
        PoolState {
            factory,
            config,
            control_tx,
            workers: Vec::new(),
            booting: HashMap::new(),
            queue: VecDeque::new(),
            next_worker_id: 1,
            terminated: false,
            aborting: HashMap::new(),
            terminate_respond: Vec::new(),
            stats_transfer_degraded: 0,
            stats_swallowed_errors: 0,
        }
    }

    async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<ControlMsg>) {
        let to_prespawn = match self.config.min_workers {
            MinWorkers::Fixed(n) => n,
            MinWorkers::Max => self.config.max_workers,
        };
        for _ in 0..to_prespawn.min(self.config.max_workers) {
            self.spawn_worker(None);
        }
        while let Some(msg) = control_rx.recv().await {
            self.handle(msg).await;
        }
    }

    async fn handle(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Exec { task, respond } => self.handle_exec(task, respond).await,
            ControlMsg::Cancel(id) => self.handle_cancel(id).await,
            ControlMsg::SetTimeout { id, deadline } => self.handle_set_timeout(id, deadline).await,
            ControlMsg::TaskTimeoutFired { id, deadline } => {
                self.handle_task_timeout_fired(id, deadline).await
            }
            ControlMsg::AbortTimeoutFired { worker_id, task_id } => {
                self.handle_abort_timeout_fired(worker_id, task_id).await
            }
            ControlMsg::WorkerEvent { worker_id, event } => {
                self.handle_worker_event(worker_id, event).await
            }
            ControlMsg::WorkerSpawned { worker_id, result } => {
                self.handle_worker_spawned(worker_id, result).await
            }
            ControlMsg::IdleTimeoutFired {
                worker_id,
                generation,
            } => self.handle_idle_timeout_fired(worker_id, generation).await,
            ControlMsg::DrainTimeoutFired => self.handle_drain_timeout_fired().await,
            ControlMsg::TerminateTimeoutFired { worker_id } => {
                self.handle_terminate_timeout_fired(worker_id).await
            }
            ControlMsg::Stats(respond) => {
                let _ = respond.send(self.snapshot_stats());
            }
            ControlMsg::Terminate {
                force,
                timeout,
                respond,
            } => self.handle_terminate(force, timeout, respond).await,
        }
    }

    // ---- submission -----------------------------------------------

    async fn handle_exec(&mut self, mut task: Task, respond: oneshot::Sender<Result<(), PoolError>>) {
        if self.terminated {
            let _ = respond.send(Err(PoolError::PoolTerminated));
            task.settle(Err(PoolError::PoolTerminated));
            return;
        }
        if self.config.max_queue_size > 0 && self.queue.len() >= self.config.max_queue_size {
            let max = self.config.max_queue_size;
            let _ = respond.send(Err(PoolError::QueueFull { max }));
            task.settle(Err(PoolError::QueueFull { max }));
            return;
        }
        let _ = respond.send(Ok(()));
        if let Some(deadline) = task.timeout_deadline {
            self.schedule_timeout(task.id, deadline);
        }
        self.queue.push_back(task);
        self.try_dispatch().await;
    }

    /// Fewest pending tasks first, ties broken by lowest worker id. Grows
    /// the fleet when every worker is saturated and there's still room
    /// under `max_workers`.
    async fn try_dispatch(&mut self) {
        loop {
            if self.queue.is_empty() {
                break;
            }
            if let Some(worker_id) = self.pick_available_worker() {
                let task = self.queue.pop_front().unwrap();
                self.dispatch_to(worker_id, task).await;
                continue;
            }
            if self.workers.len() + self.booting.len() < self.config.max_workers {
                let task = self.queue.pop_front().unwrap();
                self.spawn_worker(Some(task));
                continue;
            }
            break;
        }
    }

    fn pick_available_worker(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .filter(|w| w.available())
            .min_by_key(|w| (w.pending_tasks.len(), w.id))
            .map(|w| w.id)
    }

    async fn dispatch_to(&mut self, worker_id: WorkerId, mut task: Task) {
        task.started_at = Some(Instant::now());
        let request = Envelope::Request {
            id: task.id,
            method: task.method.clone(),
            params: task.args.clone(),
        };
        let transfer = std::mem::take(&mut task.transfer);
        let task_id = task.id;
        let timeout_deadline = task.timeout_deadline;
        let channel = {
            let worker = match self.workers.iter_mut().find(|w| w.id == worker_id) {
                Some(w) => w,
                None => return,
            };
            worker.activity_generation += 1;
            worker.pending_tasks.insert(task_id, task);
            worker.channel.clone()
        };
        if channel.send(request, transfer).await.is_err() {
            self.force_terminate_worker(worker_id).await;
            return;
        }
        if let Some(deadline) = timeout_deadline {
            self.schedule_timeout(task_id, deadline);
        }
    }

    fn spawn_worker(&mut self, reservation: Option<Task>) {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let create_info = WorkerCreateInfo { worker_id };
        let overrides = self
            .config
            .on_create_worker
            .as_ref()
            .map(|f| f(&create_info))
            .unwrap_or_default();
        self.booting.insert(worker_id, reservation);
        let factory = self.factory.clone();
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            let result = factory.spawn(worker_id, overrides).await;
            let _ = control_tx.send(ControlMsg::WorkerSpawned { worker_id, result });
        });
    }

    async fn handle_worker_spawned(
        &mut self,
        worker_id: WorkerId,
        result: Result<(Arc<dyn WorkerChannel>, ChannelEvents), PoolError>,
    ) {
        let reservation = self.booting.remove(&worker_id).flatten();
        match result {
            Ok((channel, events)) => {
                let mut handle = WorkerHandle::new(worker_id, channel, self.config.max_tasks_per_worker);
                handle.boot_reservation = reservation;
                spawn_event_forwarder(worker_id, events, self.control_tx.clone());
                self.workers.push(handle);
                if self.terminated {
                    self.force_terminate_worker(worker_id).await;
                }
            }
            Err(_) => {
                if let Some(mut task) = reservation {
                    task.settle(Err(PoolError::WorkerTerminated));
                }
                self.try_dispatch().await;
                self.maybe_signal_termination_complete();
            }
        }
    }

    // ---- inbound worker traffic -------------------------------------

    async fn handle_worker_event(&mut self, worker_id: WorkerId, event: ChannelEvent) {
        match event {
            ChannelEvent::Exit { code, signal } => self.handle_worker_exit(worker_id, code, signal).await,
            ChannelEvent::TransferDegraded { count } => {
                self.stats_transfer_degraded += count as u64;
            }
            ChannelEvent::Message(envelope) => self.handle_envelope(worker_id, envelope).await,
        }
    }

    async fn handle_envelope(&mut self, worker_id: WorkerId, envelope: Envelope) {
        match envelope {
            Envelope::Ready => self.handle_worker_ready(worker_id).await,
            Envelope::Response { id, result, error } => {
                self.handle_response(worker_id, id, result, error).await
            }
            Envelope::Event { id, payload } => self.handle_task_event(worker_id, id, payload),
            Envelope::AbortAck { id } => self.handle_abort_ack(worker_id, id).await,
            Envelope::TerminateAck => self.finalize_graceful_termination(worker_id).await,
            Envelope::SwallowedError { task_id, message } => {
                self.handle_swallowed_error(worker_id, task_id, message);
            }
            Envelope::Request { .. } | Envelope::Abort { .. } | Envelope::TerminateRequest => {
                self.protocol_violation(worker_id).await;
            }
        }
    }

    /// A `ProtocolError` promotes the offending worker straight to
    /// terminating rather than being swallowed-and-counted like an event
    /// handler, abort callback, or cleanup-hook failure.
    async fn protocol_violation(&mut self, worker_id: WorkerId) {
        tracing::warn!(worker_id, "worker sent an envelope only the pool may send");
        self.force_terminate_worker(worker_id).await;
    }

    async fn handle_worker_ready(&mut self, worker_id: WorkerId) {
        let reservation = if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
            if worker.state == WorkerState::Booting {
                worker.transition(WorkerState::Ready);
            }
            worker.boot_reservation.take()
        } else {
            None
        };
        if let Some(task) = reservation {
            self.dispatch_to(worker_id, task).await;
        }
        self.try_dispatch().await;
    }

    async fn handle_response(
        &mut self,
        worker_id: WorkerId,
        id: TaskId,
        result: Option<Value>,
        error: Option<RemoteError>,
    ) {
        self.aborting.remove(&id);
        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
            if let Some(mut task) = worker.pending_tasks.remove(&id) {
                let outcome = match (result, error) {
                    (Some(v), _) => Ok(v),
                    (None, Some(e)) => Err(e.into_pool_error()),
                    (None, None) => Ok(Value::Null),
                };
                task.settle(outcome);
            }
        }
        self.maybe_advance_draining_worker(worker_id).await;
        self.maybe_schedule_idle_reap(worker_id);
        self.try_dispatch().await;
    }

    fn handle_task_event(&mut self, worker_id: WorkerId, id: TaskId, payload: Value) {
        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
            if let Some(task) = worker.pending_tasks.get_mut(&id) {
                if task.emit(payload) {
                    self.stats_swallowed_errors += 1;
                    tracing::warn!(worker_id, task_id = id, "event handler panicked; swallowed");
                }
            }
        }
    }

    fn handle_swallowed_error(&mut self, worker_id: WorkerId, task_id: Option<TaskId>, message: String) {
        self.stats_swallowed_errors += 1;
        tracing::warn!(worker_id, ?task_id, message, "worker swallowed an error");
    }

    async fn handle_abort_ack(&mut self, worker_id: WorkerId, task_id: TaskId) {
        let reason = self.aborting.remove(&task_id);
        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
            if let Some(mut task) = worker.pending_tasks.remove(&task_id) {
                let err = match reason {
                    Some(CancelReason::Timeout(d)) => PoolError::Timeout(d),
                    _ => PoolError::Cancellation,
                };
                task.settle(Err(err));
            }
        }
        self.maybe_advance_draining_worker(worker_id).await;
        self.maybe_schedule_idle_reap(worker_id);
        self.try_dispatch().await;
    }

    async fn handle_worker_exit(&mut self, worker_id: WorkerId, _code: Option<i32>, _signal: Option<String>) {
        if let Some(mut task) = self.booting.remove(&worker_id).flatten() {
            task.settle(Err(PoolError::WorkerTerminated));
        }
        let pos = match self.workers.iter().position(|w| w.id == worker_id) {
            Some(p) => p,
            None => return,
        };
        let mut worker = self.workers.remove(pos);
        if worker.state != WorkerState::Terminated {
            worker.transition(WorkerState::Terminating);
            worker.transition(WorkerState::Terminated);
        }
        if let Some(hook) = &self.config.on_terminate_worker {
            hook(&WorkerTerminateInfo {
                worker_id,
                graceful: false,
            });
        }
        if let Some(mut task) = worker.boot_reservation.take() {
            task.settle(Err(PoolError::WorkerTerminated));
        }
        self.settle_orphaned_tasks(worker.pending_tasks.drain());
        self.try_dispatch().await;
        self.maybe_signal_termination_complete();
    }

    fn settle_orphaned_tasks(&mut self, tasks: impl Iterator<Item = (TaskId, Task)>) {
        for (id, mut task) in tasks {
            if task.is_settled() {
                continue;
            }
            let err = if let Some(reason) = self.aborting.remove(&id) {
                match reason {
                    CancelReason::User => PoolError::Cancellation,
                    CancelReason::Timeout(d) => PoolError::Timeout(d),
                }
            } else if task.is_cancelled() {
                PoolError::Cancellation
            } else {
                PoolError::WorkerTerminated
            };
            task.settle(Err(err));
        }
    }

    // ---- cancellation and timeouts -----------------------------------

    async fn handle_cancel(&mut self, id: TaskId) {
        if let Some(mut task) = self.take_undispatched(id) {
            task.mark_cancelled();
            task.settle(Err(PoolError::Cancellation));
            return;
        }
        if let Some(worker_id) = self.worker_running(id) {
            if !self.mark_running_task_cancelled(worker_id, id) {
                return;
            }
            self.aborting.insert(id, CancelReason::User);
            self.begin_abort(worker_id, id).await;
        }
    }

    async fn handle_set_timeout(&mut self, id: TaskId, deadline: Instant) {
        let mut found = false;
        if let Some(t) = self.queue.iter_mut().find(|t| t.id == id) {
            t.timeout_deadline = Some(deadline);
            found = true;
        }
        if !found {
            for reservation in self.booting.values_mut() {
                if let Some(t) = reservation {
                    if t.id == id {
                        t.timeout_deadline = Some(deadline);
                        found = true;
                        break;
                    }
                }
            }
        }
        if !found {
            for worker in self.workers.iter_mut() {
                if let Some(t) = worker.boot_reservation.as_mut() {
                    if t.id == id {
                        t.timeout_deadline = Some(deadline);
                        found = true;
                        break;
                    }
                }
                if let Some(t) = worker.pending_tasks.get_mut(&id) {
                    t.timeout_deadline = Some(deadline);
                    found = true;
                    break;
                }
            }
        }
        if found {
            self.schedule_timeout(id, deadline);
        }
    }

    async fn handle_task_timeout_fired(&mut self, id: TaskId, deadline: Instant) {
        if self.task_deadline(id) != Some(deadline) {
            return; // superseded by a later setTimeout/dispatch; stale timer.
        }
        if let Some(mut task) = self.take_undispatched(id) {
            task.mark_cancelled();
            task.settle(Err(PoolError::Timeout(Duration::ZERO)));
            return;
        }
        if let Some(worker_id) = self.worker_running(id) {
            if !self.mark_running_task_cancelled(worker_id, id) {
                return;
            }
            let elapsed = self
                .workers
                .iter()
                .find(|w| w.id == worker_id)
                .and_then(|w| w.pending_tasks.get(&id))
                .and_then(|t| t.started_at)
                .map(|s| s.elapsed())
                .unwrap_or(Duration::ZERO);
            self.aborting.insert(id, CancelReason::Timeout(elapsed));
            self.begin_abort(worker_id, id).await;
        }
    }

    /// Marks a still-running task cancelled; returns `false` if it had
    /// already settled (a response and a cancel can race).
    fn mark_running_task_cancelled(&mut self, worker_id: WorkerId, id: TaskId) -> bool {
        let worker = match self.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(w) => w,
            None => return false,
        };
        match worker.pending_tasks.get_mut(&id) {
            Some(task) if !task.is_settled() => {
                task.mark_cancelled();
                true
            }
            _ => false,
        }
    }

    async fn begin_abort(&mut self, worker_id: WorkerId, task_id: TaskId) {
        let channel = match self.workers.iter().find(|w| w.id == worker_id) {
            Some(w) => w.channel.clone(),
            None => return,
        };
        if channel.send(Envelope::Abort { id: task_id }, Vec::new()).await.is_err() {
            self.force_terminate_worker(worker_id).await;
            return;
        }
        let timeout = self.config.worker_terminate_timeout;
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = control_tx.send(ControlMsg::AbortTimeoutFired { worker_id, task_id });
        });
    }

    async fn handle_abort_timeout_fired(&mut self, worker_id: WorkerId, task_id: TaskId) {
        if !self.aborting.contains_key(&task_id) {
            return; // ABORT_ACK already resolved this one.
        }
        self.force_terminate_worker(worker_id).await;
    }

    /// Removes and returns a task that hasn't been sent to a worker yet
    /// (still queued, or reserved for a booting worker), wherever it
    /// currently lives.
    fn take_undispatched(&mut self, id: TaskId) -> Option<Task> {
        if let Some(pos) = self.queue.iter().position(|t| t.id == id) {
            return self.queue.remove(pos);
        }
        for reservation in self.booting.values_mut() {
            if reservation.as_ref().map(|t| t.id) == Some(id) {
                return reservation.take();
            }
        }
        for worker in self.workers.iter_mut() {
            if worker.boot_reservation.as_ref().map(|t| t.id) == Some(id) {
                return worker.boot_reservation.take();
            }
        }
        None
    }

    fn worker_running(&self, id: TaskId) -> Option<WorkerId> {
        self.workers
            .iter()
            .find(|w| w.pending_tasks.contains_key(&id))
            .map(|w| w.id)
    }

    fn task_deadline(&self, id: TaskId) -> Option<Instant> {
        if let Some(t) = self.queue.iter().find(|t| t.id == id) {
            return t.timeout_deadline;
        }
        for reservation in self.booting.values().flatten() {
            if reservation.id == id {
                return reservation.timeout_deadline;
            }
        }
        for worker in &self.workers {
            if let Some(t) = worker.boot_reservation.as_ref() {
                if t.id == id {
                    return t.timeout_deadline;
                }
            }
            if let Some(t) = worker.pending_tasks.get(&id) {
                return t.timeout_deadline;
            }
        }
        None
    }

    fn schedule_timeout(&mut self, task_id: TaskId, deadline: Instant) {
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            let now = Instant::now();
            if deadline > now {
                tokio::time::sleep(deadline - now).await;
            }
            let _ = control_tx.send(ControlMsg::TaskTimeoutFired {
                id: task_id,
                deadline,
            });
        });
    }

    // ---- idle reaping ---------------------------------------------

    fn resolved_min_workers(&self) -> usize {
        match self.config.min_workers {
            MinWorkers::Fixed(n) => n,
            MinWorkers::Max => self.config.max_workers,
        }
    }

    fn maybe_schedule_idle_reap(&mut self, worker_id: WorkerId) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        if self.terminated || self.workers.len() <= self.resolved_min_workers() {
            return;
        }
        let worker = match self.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(w) => w,
            None => return,
        };
        if !worker.is_idle() {
            return;
        }
        worker.activity_generation += 1;
        let generation = worker.activity_generation;
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let _ = control_tx.send(ControlMsg::IdleTimeoutFired {
                worker_id,
                generation,
            });
        });
    }

    async fn handle_idle_timeout_fired(&mut self, worker_id: WorkerId, generation: u64) {
        let should_reap = self
            .workers
            .iter()
            .find(|w| w.id == worker_id)
            .map(|w| w.is_idle() && w.activity_generation == generation)
            .unwrap_or(false)
            && self.workers.len() > self.resolved_min_workers();
        if !should_reap {
            return;
        }
        self.graceful_terminate_worker(worker_id).await;
    }

    // ---- drain / terminate -----------------------------------------

    async fn maybe_advance_draining_worker(&mut self, worker_id: WorkerId) {
        let ready = self
            .workers
            .iter()
            .find(|w| w.id == worker_id)
            .map(|w| w.state == WorkerState::Draining && w.pending_tasks.is_empty())
            .unwrap_or(false);
        if ready {
            self.graceful_terminate_worker(worker_id).await;
        }
    }

    async fn graceful_terminate_worker(&mut self, worker_id: WorkerId) {
        let channel = match self.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(w) => {
                w.transition(WorkerState::Terminating);
                w.channel.clone()
            }
            None => return,
        };
        if channel.send(Envelope::TerminateRequest, Vec::new()).await.is_err() {
            self.force_terminate_worker(worker_id).await;
            return;
        }
        let timeout = self.config.worker_terminate_timeout;
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = control_tx.send(ControlMsg::TerminateTimeoutFired { worker_id });
        });
    }

    async fn finalize_graceful_termination(&mut self, worker_id: WorkerId) {
        let pos = match self.workers.iter().position(|w| w.id == worker_id) {
            Some(p) => p,
            None => return,
        };
        let mut worker = self.workers.remove(pos);
        worker.transition(WorkerState::Terminated);
        if let Some(hook) = &self.config.on_terminate_worker {
            hook(&WorkerTerminateInfo {
                worker_id,
                graceful: true,
            });
        }
        self.settle_orphaned_tasks(worker.pending_tasks.drain());
        self.try_dispatch().await;
        self.maybe_signal_termination_complete();
    }

    async fn handle_terminate_timeout_fired(&mut self, worker_id: WorkerId) {
        let still_pending = self
            .workers
            .iter()
            .any(|w| w.id == worker_id && w.state == WorkerState::Terminating);
        if still_pending {
            self.force_terminate_worker(worker_id).await;
        }
    }

    async fn handle_drain_timeout_fired(&mut self) {
        let draining: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Draining)
            .map(|w| w.id)
            .collect();
        for id in draining {
            self.graceful_terminate_worker(id).await;
        }
        let still_booting: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Booting)
            .map(|w| w.id)
            .collect();
        for id in still_booting {
            self.force_terminate_worker(id).await;
        }
    }

    async fn force_terminate_worker(&mut self, worker_id: WorkerId) {
        let pos = match self.workers.iter().position(|w| w.id == worker_id) {
            Some(p) => p,
            None => return,
        };
        let mut worker = self.workers.remove(pos);
        if worker.state != WorkerState::Terminated {
            if worker.state != WorkerState::Terminating {
                worker.transition(WorkerState::Terminating);
            }
            worker.channel.terminate(true).await;
            worker.transition(WorkerState::Terminated);
        }
        if let Some(hook) = &self.config.on_terminate_worker {
            hook(&WorkerTerminateInfo {
                worker_id,
                graceful: false,
            });
        }
        if let Some(mut task) = worker.boot_reservation.take() {
            task.settle(Err(PoolError::WorkerTerminated));
        }
        self.settle_orphaned_tasks(worker.pending_tasks.drain());
        Box::pin(self.try_dispatch()).await;
        self.maybe_signal_termination_complete();
    }

    async fn handle_terminate(
        &mut self,
        force: bool,
        timeout: Option<Duration>,
        respond: oneshot::Sender<()>,
    ) {
        self.terminated = true;
        while let Some(mut task) = self.queue.pop_front() {
            task.settle(Err(PoolError::PoolTerminated));
        }
        for reservation in self.booting.values_mut() {
            if let Some(mut task) = reservation.take() {
                task.settle(Err(PoolError::PoolTerminated));
            }
        }
        for worker in self.workers.iter_mut() {
            if let Some(mut task) = worker.boot_reservation.take() {
                task.settle(Err(PoolError::PoolTerminated));
            }
        }

        if self.workers.is_empty() && self.booting.is_empty() {
            let _ = respond.send(());
            return;
        }
        self.terminate_respond.push(respond);

        if force {
            let worker_ids: Vec<WorkerId> = self.workers.iter().map(|w| w.id).collect();
            for id in worker_ids {
                self.force_terminate_worker(id).await;
            }
            return;
        }

        for worker in self.workers.iter_mut() {
            if worker.state == WorkerState::Ready {
                worker.transition(WorkerState::Draining);
            }
        }
        let idle_draining: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Draining && w.pending_tasks.is_empty())
            .map(|w| w.id)
            .collect();
        for id in idle_draining {
            self.graceful_terminate_worker(id).await;
        }

        let drain_budget = timeout.unwrap_or(self.config.worker_terminate_timeout);
        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(drain_budget).await;
            let _ = control_tx.send(ControlMsg::DrainTimeoutFired);
        });
    }

    fn maybe_signal_termination_complete(&mut self) {
        if self.terminated && self.workers.is_empty() && self.booting.is_empty() {
            for tx in self.terminate_respond.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    fn snapshot_stats(&self) -> PoolStats {
        let total_workers = self.workers.len();
        let busy_workers = self.workers.iter().filter(|w| w.processing()).count();
        let active_tasks = self.workers.iter().map(|w| w.pending_tasks.len()).sum();
        PoolStats {
            total_workers,
            busy_workers,
            idle_workers: total_workers - busy_workers,
            pending_tasks: self.queue.len(),
            active_tasks,
            transfer_degraded: self.stats_transfer_degraded,
            swallowed_errors: self.stats_swallowed_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A factory that is never actually called: paired with
    /// `max_workers(0)`, every submitted task just sits in the queue.
    struct NullFactory;

    #[async_trait]
    impl WorkerFactory for NullFactory {
        async fn spawn(
            &self,
            _worker_id: WorkerId,
            _overrides: WorkerSpawnOverrides,
        ) -> Result<(Arc<dyn WorkerChannel>, ChannelEvents), PoolError> {
            unreachable!("max_workers(0) never asks the factory to spawn")
        }
    }

    proptest! {
        /// Task ids assigned by `Pool::exec` are strictly increasing
        /// regardless of how many calls are submitted, since nothing ever
        /// settles or reuses one.
        #[test]
        fn task_ids_are_strictly_monotonic(n in 1usize..50) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let config = PoolConfig::default().with_max_workers(0);
                let pool = Pool::new(Arc::new(NullFactory), config);
                let mut last = None;
                for _ in 0..n {
                    let handle = pool
                        .exec("noop", Vec::new(), ExecOptions::default())
                        .await
                        .expect("queues with no worker cap");
                    let id = handle.id();
                    if let Some(prev) = last {
                        prop_assert!(id > prev);
                    }
                    last = Some(id);
                }
                Ok(())
            })?;
        }
    }
}
