//! `Task`: one pending/in-flight call. Exclusively owned by the pool's
//! control loop; the caller only ever sees a weak reference to it
//! through [`crate::handle::TaskHandle`] and its id.

use crate::envelope::TaskId;
use crate::error::PoolError;
use crate::value::Value;
use bytes::Bytes;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

pub type EventHandler = Box<dyn FnMut(Value) + Send>;

/// One unit of work submitted through [`crate::pool::Pool::exec`].
///
/// `resolver` is a single-shot resolve/reject continuation; settling is
/// idempotent because `resolve_task` takes the sender, so a second
/// attempt is simply a no-op rather than a panic or a double-send.
pub struct Task {
    pub id: TaskId,
    pub method: String,
    pub args: Vec<Value>,
    pub transfer: Vec<Bytes>,
    pub timeout_deadline: Option<Instant>,
    pub started_at: Option<Instant>,
    pub cancelled: Arc<AtomicBool>,
    resolver: Option<oneshot::Sender<Result<Value, PoolError>>>,
    event_handler: Option<EventHandler>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        method: String,
        args: Vec<Value>,
        transfer: Vec<Bytes>,
        event_handler: Option<EventHandler>,
        timeout_deadline: Option<Instant>,
        cancelled: Arc<AtomicBool>,
        resolver: oneshot::Sender<Result<Value, PoolError>>,
    ) -> Self {
        Task {
            id,
            method,
            args,
            transfer,
            timeout_deadline,
            started_at: None,
            cancelled,
            resolver: Some(resolver),
            event_handler,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.resolver.is_none()
    }

    /// Runs the resolver at most once. Later calls are no-ops, which is
    /// how late events get dropped when they race a settlement between a
    /// worker response and a cancellation.
    pub fn settle(&mut self, result: Result<Value, PoolError>) {
        if let Some(tx) = self.resolver.take() {
            let _ = tx.send(result);
        }
    }

    /// Forwards an `EVENT` payload to the caller's handler, unless the
    /// task has already settled: late events are dropped and never
    /// settle an unrelated task. A panicking handler is caught and
    /// swallowed rather than propagated, so one caller's broken callback
    /// cannot take down the control loop; returns `true` when a panic
    /// was swallowed.
    pub fn emit(&mut self, payload: Value) -> bool {
        if self.is_settled() {
            return false;
        }
        let Some(handler) = self.event_handler.as_mut() else {
            return false;
        };
        panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err()
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("settled", &self.is_settled())
            .finish()
    }
}
