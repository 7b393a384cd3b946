//! `WorkerChannel`: the abstract duplex transport to one isolate.
//! Process, thread and web-style workers are all external collaborators
//! the core talks to uniformly through this trait — the core itself
//! never spawns an OS resource.

use crate::envelope::Envelope;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// Raised by [`WorkerChannel::send`] when the underlying transport has
/// already gone away.
#[derive(Debug, thiserror::Error)]
#[error("worker channel is closed")]
pub struct ChannelClosed;

/// Inbound notifications a channel implementation produces. Rust has no
/// ergonomic analogue of JS's `onMessage`/`onExit` callback registration,
/// so both are modeled as variants of one stream the pool drains in
/// arrival order, returned once at construction time by a
/// [`crate::pool::WorkerFactory`].
#[derive(Debug)]
pub enum ChannelEvent {
    Message(Envelope),
    /// Fired exactly once per channel.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// A transport that could not honor `transfer` fell back to copying;
    /// the pool folds this into `PoolStats::transfer_degraded` instead
    /// of failing the call.
    TransferDegraded { count: u32 },
}

/// The abstract contract every concrete transport implements.
///
/// Why: the dispatch core's whole value proposition is scheduling
/// policy that doesn't care whether a worker is an OS process, a
/// thread, or (in a future transport) a web worker. Pinning that
/// boundary to one trait keeps `forgepool-process` a thin adapter
/// rather than something the scheduler has special-cased knowledge of.
///
/// What: two operations — enqueue a frame, and ask the isolate to go
/// away — plus the [`ChannelEvent`] stream handed back at construction
/// for everything flowing the other direction.
///
/// How: object-safe on purpose. The pool holds a single, homogeneous
/// `Vec<WorkerHandle>` over a fleet whose members may be backed by
/// different transports (a process pool mixed with an in-process mock in
/// tests, for instance), so `Arc<dyn WorkerChannel>` has to work.
#[async_trait]
pub trait WorkerChannel: Send + Sync + fmt::Debug {
    /// Non-blocking enqueue. `transfer` lists binary regions that should
    /// be moved rather than copied when the transport supports it —
    /// implementations that cannot move ownership must copy and are
    /// expected to report the degradation through whatever stats
    /// mechanism the caller wired up; the core does not fail the call
    /// over this.
    async fn send(&self, envelope: Envelope, transfer: Vec<Bytes>) -> Result<(), ChannelClosed>;

    /// Graceful if `force` is false, forced kill otherwise. Resolves once
    /// the isolate is gone.
    async fn terminate(&self, force: bool);
}

/// Paired with every [`WorkerChannel`]: the event stream produced when
/// the channel was created.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Convenience constructor for implementations driven by an
/// `mpsc::UnboundedSender`/`Receiver` pair, which is how every
/// reference channel in this workspace (the in-memory mock used by the
/// core's own tests, and `forgepool-process`'s subprocess channel) wires
/// its background reader task to the pool.
pub fn channel_events() -> (mpsc::UnboundedSender<ChannelEvent>, ChannelEvents) {
    mpsc::unbounded_channel()
}
