//! Error taxonomy for the dispatch core.
//!
//! Every task settles exactly once, with either a result or one of these
//! kinds. `name()` is the stable wire identifier used when marshalling a
//! `PoolError` into a [`RemoteError`] and back, so a rejection crossing
//! the `WorkerChannel` boundary keeps its kind intact.

use crate::envelope::RemoteError;
use crate::value::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no handler registered for method `{method}`")]
    MethodNotFound { method: String },

    #[error("task was cancelled")]
    Cancellation,

    #[error("task exceeded its timeout of {0:?}")]
    Timeout(Duration),

    #[error("queue is full (max_queue_size = {max})")]
    QueueFull { max: usize },

    #[error("pool has been terminated")]
    PoolTerminated,

    #[error("worker terminated while the task was in flight")]
    WorkerTerminated,

    #[error("handler raised an error: {message}")]
    Handler {
        message: String,
        stack: Option<String>,
        fields: Value,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("worker channel is closed")]
    ChannelClosed,
}

impl PoolError {
    /// Stable `name` used on the wire and matched back on the receiving
    /// side by [`RemoteError::into_pool_error`].
    pub fn name(&self) -> &'static str {
        match self {
            PoolError::MethodNotFound { .. } => "MethodNotFound",
            PoolError::Cancellation => "CancellationError",
            PoolError::Timeout(_) => "TimeoutError",
            PoolError::QueueFull { .. } => "QueueFullError",
            PoolError::PoolTerminated => "PoolTerminatedError",
            PoolError::WorkerTerminated => "WorkerTerminatedError",
            PoolError::Handler { .. } => "HandlerError",
            PoolError::Protocol(_) => "ProtocolError",
            PoolError::ChannelClosed => "ChannelClosed",
        }
    }

    /// Marshal into the wire form:
    /// `{ name, message, stack, ...ownEnumerableFields }`.
    pub fn into_remote(self) -> RemoteError {
        let name = self.name().to_string();
        match self {
            PoolError::Handler {
                message,
                stack,
                fields,
            } => RemoteError {
                name,
                message,
                stack,
                fields,
            },
            other => RemoteError {
                message: other.to_string(),
                name,
                stack: None,
                fields: Value::Null,
            },
        }
    }
}

impl RemoteError {
    /// Reconstruct a rejection value from a marshalled error, preserving
    /// every field the sender attached.
    pub fn into_pool_error(self) -> PoolError {
        match self.name.as_str() {
            "MethodNotFound" => PoolError::MethodNotFound {
                method: self
                    .fields
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| "<unknown>".to_string()),
            },
            "CancellationError" => PoolError::Cancellation,
            "TimeoutError" => PoolError::Timeout(Duration::ZERO),
            "QueueFullError" => PoolError::QueueFull { max: 0 },
            "PoolTerminatedError" => PoolError::PoolTerminated,
            "WorkerTerminatedError" => PoolError::WorkerTerminated,
            "ProtocolError" => PoolError::Protocol(self.message),
            _ => PoolError::Handler {
                message: self.message,
                stack: self.stack,
                fields: self.fields,
            },
        }
    }
}
