//! Dispatch core of a worker pool runtime: queues calls onto a bounded
//! fleet of isolated workers, multiplexes many concurrent callers onto
//! that fleet, and returns results asynchronously with cancellation,
//! timeouts, cooperative abort, streaming events, and transferable
//! binary regions.
//!
//! This crate is transport-agnostic — it never spawns an OS process, a
//! thread, or anything else. [`channel::WorkerChannel`] is the seam a
//! concrete transport crate (the OS-process one lives in
//! `forgepool-process`) implements to plug a fleet of isolates into the
//! scheduler in [`pool`].

pub mod channel;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handle;
pub mod pool;
pub mod proxy;
pub mod task;
pub mod transfer;
pub mod value;
pub mod worker_handle;

pub use channel::{ChannelClosed, ChannelEvent, ChannelEvents, WorkerChannel};
pub use dispatcher::{AbortTimeoutPolicy, CallContext, Dispatcher, DispatcherTransport, Handler, ServeOutcome};
pub use envelope::{Envelope, RemoteError, TaskId};
pub use error::PoolError;
pub use handle::TaskHandle;
pub use pool::{
    ExecOptions, MinWorkers, Pool, PoolConfig, PoolStats, WorkerCreateInfo, WorkerFactory,
    WorkerSpawnOverrides, WorkerTerminateInfo,
};
pub use proxy::Proxy;
pub use transfer::Transfer;
pub use value::Value;
pub use worker_handle::{WorkerHandle, WorkerId, WorkerState};
