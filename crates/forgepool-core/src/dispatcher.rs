//! Worker-side dispatcher: registers handlers, serves `REQUEST`s, emits
//! `EVENT`s, negotiates `ABORT`, and runs the optional `__cleanup__`
//! hook on `TERMINATE_REQUEST`.
//!
//! Unlike the pool side, nothing here assumes a particular transport —
//! [`DispatcherTransport`] is the worker's half of the duplex channel
//! `forgepool-process` wires over stdio, kept separate from
//! [`crate::channel::WorkerChannel`] because the two run in different
//! processes and never share a type.

use crate::channel::ChannelClosed;
use crate::envelope::{Envelope, TaskId};
use crate::error::PoolError;
use crate::value::Value;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The worker process's half of the duplex channel to the pool.
///
/// Why: mirrors [`crate::channel::WorkerChannel`] on the other end of
/// the same wire, but the two are deliberately separate traits rather
/// than one shared one — a `forgepool-process` worker runs in a
/// different OS process from the pool and never has a value of the
/// pool-side type to implement against.
///
/// What: `recv`/`send` carry the envelope stream in each direction;
/// `send_with_transfer` is the opt-in fast path for a `send` that also
/// wants to report whether a binary region moved.
#[async_trait]
pub trait DispatcherTransport: Send {
    /// `None` signals the transport closed; the serve loop treats this
    /// the same as an unexpected exit.
    async fn recv(&mut self) -> Option<Envelope>;
    async fn send(&mut self, envelope: Envelope) -> Result<(), ChannelClosed>;

    /// Like `send`, but flags `transfer` as binary regions the transport
    /// should move rather than copy if it can. Returns whether the move
    /// actually happened. The default degrades to a plain `send` and
    /// reports no move, which is correct for any transport (a pipe, for
    /// instance) that has no ownership-transfer primitive of its own.
    async fn send_with_transfer(
        &mut self,
        envelope: Envelope,
        transfer: Vec<Bytes>,
    ) -> Result<bool, ChannelClosed> {
        let _ = transfer;
        self.send(envelope).await.map(|_| false)
    }
}

/// Outbound traffic queued by a running call, drained by [`Dispatcher::serve`].
enum OutMessage {
    Plain(Envelope),
    WithTransfer {
        envelope: Envelope,
        transfer: Vec<Bytes>,
        respond: oneshot::Sender<bool>,
    },
}

/// Per-call context passed to a [`Handler`]: `emit` for progress events,
/// `on_abort` to register a cooperative cancellation callback.
///
/// Why: a handler needs a narrow capability object rather than the
/// whole `Dispatcher` — it can stream events and register abort
/// listeners for its own call, and nothing else, which keeps one
/// handler from reaching into another in-flight call's state.
///
/// What: cheap to clone (an id plus two `Arc`-backed handles), so a
/// handler is free to move it into spawned subtasks.
#[derive(Clone)]
pub struct CallContext {
    id: TaskId,
    out_tx: mpsc::UnboundedSender<OutMessage>,
    abort_callbacks: Arc<StdMutex<Vec<AbortCallback>>>,
}

impl CallContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Sends `EVENT{id, payload}`. Fire-and-forget: a closed transport
    /// simply drops it, same as a settled task dropping late events.
    pub fn emit(&self, payload: Value) {
        let envelope = Envelope::Event { id: self.id, payload };
        let _ = self.out_tx.send(OutMessage::Plain(envelope));
    }

    /// Sends `EVENT{id, payload}`, flagging `transfer` as binary regions
    /// to move rather than copy. Awaits the transport's actual send so
    /// the caller can report whether the move happened (`isDetached`);
    /// returns `false` if the transport degraded to a copy or has
    /// already closed.
    pub async fn emit_with_transfer(&self, payload: Value, transfer: Vec<Bytes>) -> bool {
        let envelope = Envelope::Event { id: self.id, payload };
        let (respond, done) = oneshot::channel();
        if self
            .out_tx
            .send(OutMessage::WithTransfer { envelope, transfer, respond })
            .is_err()
        {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Registers a cooperative cancellation callback, part of the
    /// cooperative-yet-preemptive cancellation scheme. Callbacks run, in
    /// registration order, only if `ABORT{id}` arrives before the call
    /// settles.
    pub fn on_abort(&self, cb: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) {
        self.abort_callbacks.lock().unwrap().push(Box::new(cb));
    }
}

type AbortCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A registered method: `(args) -> future-of-value`, the dynamic method
/// registry rendered as a uniform handler variant.
pub type Handler = Arc<dyn Fn(Vec<Value>, CallContext) -> BoxFuture<'static, Result<Value, PoolError>> + Send + Sync>;

type InFlight = Arc<StdMutex<HashMap<TaskId, Arc<StdMutex<Vec<AbortCallback>>>>>>;

/// What happens when an `onAbort` callback fails to settle within
/// `abort_listener_timeout`: by default the dispatcher exits the
/// process. [`AbortTimeoutPolicy::ReturnOutcome`] exists so tests can
/// observe the would-have-exited outcome without tearing down the test
/// binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortTimeoutPolicy {
    ExitProcess,
    ReturnOutcome,
}

/// Why [`Dispatcher::serve`] returned.
#[derive(Debug, PartialEq, Eq)]
pub enum ServeOutcome {
    /// `TERMINATE_REQUEST` was handled and `TERMINATE_ACK` sent.
    TerminatedGracefully,
    /// The transport closed or a send failed.
    TransportClosed,
    /// An abort listener missed its deadline and the policy was
    /// [`AbortTimeoutPolicy::ReturnOutcome`] instead of exiting.
    AbortTimeoutExit { task_id: TaskId },
}

/// Builds the method registry and serves one worker's duplex channel.
///
/// Why: a worker's entire job is "answer `REQUEST`s, honor `ABORT`s,
/// run `__cleanup__` on the way out" — `Dispatcher` is the builder for
/// that behavior, consumed once by [`Dispatcher::serve`] so a worker's
/// method table can't be mutated mid-flight.
///
/// What: a fluent `with_*`/`register` builder over a fixed set of
/// tunables (abort timeout, its failure policy, the terminate budget)
/// plus the handler map itself.
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    cleanup: Option<Handler>,
    abort_listener_timeout: Duration,
    abort_timeout_policy: AbortTimeoutPolicy,
    worker_terminate_timeout: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            handlers: HashMap::new(),
            cleanup: None,
            abort_listener_timeout: Duration::from_millis(1000),
            abort_timeout_policy: AbortTimeoutPolicy::ExitProcess,
            worker_terminate_timeout: Duration::from_millis(1000),
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// `methods` and `__cleanup__` are reserved names and never reach
    /// `handlers`; registering one is a programming error.
    pub fn register(mut self, name: impl Into<String>, handler: Handler) -> Self {
        let name = name.into();
        debug_assert!(
            name != "methods" && name != "__cleanup__",
            "{name} is a reserved method name"
        );
        self.handlers.insert(name, handler);
        self
    }

    pub fn on_terminate(mut self, handler: Handler) -> Self {
        self.cleanup = Some(handler);
        self
    }

    pub fn with_abort_listener_timeout(mut self, d: Duration) -> Self {
        self.abort_listener_timeout = d;
        self
    }

    pub fn with_abort_timeout_policy(mut self, p: AbortTimeoutPolicy) -> Self {
        self.abort_timeout_policy = p;
        self
    }

    pub fn with_worker_terminate_timeout(mut self, d: Duration) -> Self {
        self.worker_terminate_timeout = d;
        self
    }

    /// Sends `READY`, then drives the worker's event loop until the
    /// transport closes or `TERMINATE_REQUEST` is handled.
    ///
    /// How: one `tokio::select!` loop, biased toward draining a pending
    /// abort-timeout exit and outbound traffic before reading the next
    /// inbound envelope, so an `AbortAck`/`SwallowedError`/`TerminateAck`
    /// queued ahead of a process exit always reaches the transport first.
    pub async fn serve(self, mut transport: impl DispatcherTransport) -> ServeOutcome {
        if transport.send(Envelope::Ready).await.is_err() {
            return ServeOutcome::TransportClosed;
        }

        let in_flight: InFlight = Arc::new(StdMutex::new(HashMap::new()));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutMessage>();
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<TaskId>();

        loop {
            tokio::select! {
                biased;

                Some(task_id) = exit_rx.recv() => {
                    match self.abort_timeout_policy {
                        AbortTimeoutPolicy::ExitProcess => {
                            while let Ok(msg) = out_rx.try_recv() {
                                let _ = Self::send_out(&mut transport, msg).await;
                            }
                            std::process::exit(1);
                        }
                        AbortTimeoutPolicy::ReturnOutcome => {
                            return ServeOutcome::AbortTimeoutExit { task_id };
                        }
                    }
                }

                Some(msg) = out_rx.recv() => {
                    if Self::send_out(&mut transport, msg).await.is_err() {
                        return ServeOutcome::TransportClosed;
                    }
                }

                incoming = transport.recv() => {
                    match incoming {
                        None => return ServeOutcome::TransportClosed,
                        Some(Envelope::Request { id, method, params }) => {
                            self.spawn_call(id, method, params, out_tx.clone(), in_flight.clone());
                        }
                        Some(Envelope::Abort { id }) => {
                            self.spawn_abort(id, out_tx.clone(), in_flight.clone(), exit_tx.clone());
                        }
                        Some(Envelope::TerminateRequest) => {
                            self.run_cleanup(&out_tx).await;
                            while let Ok(msg) = out_rx.try_recv() {
                                let _ = Self::send_out(&mut transport, msg).await;
                            }
                            if transport.send(Envelope::TerminateAck).await.is_err() {
                                return ServeOutcome::TransportClosed;
                            }
                            return ServeOutcome::TerminatedGracefully;
                        }
                        // Response/Event/Ready/AbortAck/TerminateAck only ever flow
                        // pool -> worker in reverse; a worker never receives them.
                        Some(_) => {}
                    }
                }
            }
        }
    }

    /// Drains one queued [`OutMessage`] onto the transport, settling the
    /// `respond` channel of a `WithTransfer` so the originating
    /// `emit_with_transfer` call can report `isDetached` back to its caller.
    async fn send_out(
        transport: &mut impl DispatcherTransport,
        msg: OutMessage,
    ) -> Result<(), ChannelClosed> {
        match msg {
            OutMessage::Plain(envelope) => transport.send(envelope).await,
            OutMessage::WithTransfer { envelope, transfer, respond } => {
                let result = transport.send_with_transfer(envelope, transfer).await;
                match result {
                    Ok(moved) => {
                        let _ = respond.send(moved);
                        Ok(())
                    }
                    Err(err) => {
                        let _ = respond.send(false);
                        Err(err)
                    }
                }
            }
        }
    }

    fn spawn_call(
        &self,
        id: TaskId,
        method: String,
        params: Vec<Value>,
        out_tx: mpsc::UnboundedSender<OutMessage>,
        in_flight: InFlight,
    ) {
        if method == "methods" {
            let names: Vec<Value> = self.handlers.keys().cloned().map(Value::String).collect();
            let _ = out_tx.send(OutMessage::Plain(Envelope::ok_response(id, Value::Array(names))));
            return;
        }
        let handler = match self.handlers.get(&method) {
            Some(h) => h.clone(),
            None => {
                let err = PoolError::MethodNotFound { method }.into_remote();
                let _ = out_tx.send(OutMessage::Plain(Envelope::err_response(id, err)));
                return;
            }
        };
        let callbacks = Arc::new(StdMutex::new(Vec::new()));
        in_flight.lock().unwrap().insert(id, callbacks.clone());
        let ctx = CallContext {
            id,
            out_tx: out_tx.clone(),
            abort_callbacks: callbacks,
        };
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let outcome = handler(params, ctx).await;
            in_flight.lock().unwrap().remove(&id);
            let envelope = match outcome {
                Ok(value) => Envelope::ok_response(id, value),
                Err(err) => Envelope::err_response(id, err.into_remote()),
            };
            let _ = out_tx.send(OutMessage::Plain(envelope));
        });
    }

    /// Runs every registered `onAbort` callback for `id` concurrently,
    /// isolating each one with `catch_unwind` so a panicking callback
    /// neither poisons its siblings nor takes down the worker process —
    /// a panic becomes a `SwallowedError` envelope instead, mirroring how
    /// the pool side swallows a panicking event handler.
    fn spawn_abort(
        &self,
        id: TaskId,
        out_tx: mpsc::UnboundedSender<OutMessage>,
        in_flight: InFlight,
        exit_tx: mpsc::UnboundedSender<TaskId>,
    ) {
        let callbacks = in_flight.lock().unwrap().remove(&id);
        let Some(callbacks) = callbacks else {
            // Already settled; nothing to cooperatively cancel, but the
            // pool is waiting on an ack regardless.
            let _ = out_tx.send(OutMessage::Plain(Envelope::AbortAck { id }));
            return;
        };
        let timeout = self.abort_listener_timeout;
        tokio::spawn(async move {
            let pending: Vec<AbortCallback> = std::mem::take(&mut *callbacks.lock().unwrap());
            let out_tx_panics = out_tx.clone();
            let joined = join_all(pending.into_iter().map(move |cb| {
                let out_tx = out_tx_panics.clone();
                async move {
                    // `cb()` itself can panic before ever producing a future
                    // (a callback that never actually awaits anything), so
                    // the call is isolated separately from polling its result.
                    let panicked = match panic::catch_unwind(AssertUnwindSafe(cb)) {
                        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await.is_err(),
                        Err(_) => true,
                    };
                    if panicked {
                        let _ = out_tx.send(OutMessage::Plain(Envelope::SwallowedError {
                            task_id: Some(id),
                            message: "abort callback panicked".to_string(),
                        }));
                    }
                }
            }));
            let settled = tokio::time::timeout(timeout, joined).await.is_ok();
            let _ = out_tx.send(OutMessage::Plain(Envelope::AbortAck { id }));
            if !settled {
                let _ = exit_tx.send(id);
            }
        });
    }

    /// Runs the optional `__cleanup__` hook, if any, within
    /// `worker_terminate_timeout` minus a small margin for the ack itself.
    /// A hook that panics or returns `Err` is swallowed and reported as a
    /// `SwallowedError` with no task id, since the hook isn't scoped to
    /// any one call; a bare timeout is not an error and is not reported.
    async fn run_cleanup(&self, out_tx: &mpsc::UnboundedSender<OutMessage>) {
        let Some(cleanup) = &self.cleanup else {
            return;
        };
        let ctx = CallContext {
            id: 0,
            out_tx: out_tx.clone(),
            abort_callbacks: Arc::new(StdMutex::new(Vec::new())),
        };
        let budget = self
            .worker_terminate_timeout
            .saturating_sub(Duration::from_millis(5));
        // Calling `cleanup(...)` itself, not just polling its future, can
        // panic (a handler that panics before ever awaiting), so that call
        // is isolated the same way as an abort callback's.
        let failed = match panic::catch_unwind(AssertUnwindSafe(|| cleanup(Vec::new(), ctx))) {
            Ok(fut) => {
                let outcome = tokio::time::timeout(budget, AssertUnwindSafe(fut).catch_unwind()).await;
                match outcome {
                    Ok(Ok(Ok(_))) => false,
                    Ok(Ok(Err(_))) | Ok(Err(_)) => true,
                    Err(_) => false,
                }
            }
            Err(_) => true,
        };
        if failed {
            let _ = out_tx.send(OutMessage::Plain(Envelope::SwallowedError {
                task_id: None,
                message: "onTerminate hook failed".to_string(),
            }));
        }
    }
}
