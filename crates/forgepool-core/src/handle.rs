//! `TaskHandle`: the caller-facing future returned by
//! [`crate::pool::Pool::exec`]. Rust has no thenable to extend, so the
//! cancellable-promise shape becomes a plain [`Future`] impl plus two
//! extra methods that poke the control loop directly.

use crate::envelope::TaskId;
use crate::error::PoolError;
use crate::pool::ControlMsg;
use crate::value::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// A single in-flight call. Awaiting it resolves to the call's result or
/// its [`PoolError`]; dropping it without awaiting leaves the task
/// running to completion (the caller just stops listening), matching a
/// JS promise's fire-and-forget semantics.
pub struct TaskHandle {
    id: TaskId,
    resolve_rx: oneshot::Receiver<Result<Value, PoolError>>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        resolve_rx: oneshot::Receiver<Result<Value, PoolError>>,
        control_tx: mpsc::UnboundedSender<ControlMsg>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        TaskHandle {
            id,
            resolve_rx,
            control_tx,
            cancelled,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation. Idempotent; a task that has already
    /// settled simply ignores it.
    pub fn cancel(&self) {
        let _ = self.control_tx.send(ControlMsg::Cancel(self.id));
    }

    /// Installs or replaces this task's deadline after submission;
    /// redundant calls override any prior timeout.
    pub fn timeout(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let _ = self.control_tx.send(ControlMsg::SetTimeout {
            id: self.id,
            deadline,
        });
    }
}

impl Future for TaskHandle {
    type Output = Result<Value, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.resolve_rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::PoolTerminated)),
            Poll::Pending => Poll::Pending,
        }
    }
}
