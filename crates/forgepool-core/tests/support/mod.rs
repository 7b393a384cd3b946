//! A worker "process" that never leaves this binary: an in-memory duplex
//! pipe joining a real [`Dispatcher`] to a real [`Pool`] through the same
//! `WorkerChannel`/`DispatcherTransport` seams a subprocess would use.
//! Lets the scenario tests in this directory exercise the whole dispatch
//! core without spawning an OS process.

use async_trait::async_trait;
use bytes::Bytes;
use forgepool_core::channel::{channel_events, ChannelClosed, ChannelEvent, ChannelEvents};
use forgepool_core::dispatcher::{Dispatcher, DispatcherTransport, ServeOutcome};
use forgepool_core::envelope::Envelope;
use forgepool_core::error::PoolError;
use forgepool_core::pool::{WorkerFactory, WorkerSpawnOverrides};
use forgepool_core::{WorkerChannel, WorkerId};
use std::sync::Arc;
use tokio::sync::mpsc;

struct InMemoryChannel {
    to_worker: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl WorkerChannel for InMemoryChannel {
    async fn send(&self, envelope: Envelope, _transfer: Vec<Bytes>) -> Result<(), ChannelClosed> {
        self.to_worker.send(envelope).map_err(|_| ChannelClosed)
    }

    async fn terminate(&self, _force: bool) {
        // Dropping `to_worker` would close the worker's recv loop; the
        // scenario tests all exercise the envelope-level protocol
        // instead, so there is nothing extra to do here.
    }
}

impl std::fmt::Debug for InMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChannel").finish()
    }
}

struct InMemoryTransport {
    from_pool: mpsc::UnboundedReceiver<Envelope>,
    to_pool: mpsc::UnboundedSender<ChannelEvent>,
}

#[async_trait]
impl DispatcherTransport for InMemoryTransport {
    async fn recv(&mut self) -> Option<Envelope> {
        self.from_pool.recv().await
    }

    async fn send(&mut self, envelope: Envelope) -> Result<(), ChannelClosed> {
        self.to_pool
            .send(ChannelEvent::Message(envelope))
            .map_err(|_| ChannelClosed)
    }

    // The in-memory pipe owns both ends of the `Bytes`, so handing one
    // over genuinely transfers ownership rather than copying — unlike a
    // real subprocess transport, there is no serialization boundary to
    // force a copy across.
    async fn send_with_transfer(
        &mut self,
        envelope: Envelope,
        _transfer: Vec<Bytes>,
    ) -> Result<bool, ChannelClosed> {
        self.send(envelope).await.map(|_| true)
    }
}

/// Builds one fresh [`Dispatcher`] per spawned worker, same as a real
/// `WorkerFactory` would exec one fresh process per worker.
pub struct InMemoryFactory {
    build: Box<dyn Fn() -> Dispatcher + Send + Sync>,
}

impl InMemoryFactory {
    pub fn new(build: impl Fn() -> Dispatcher + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(InMemoryFactory {
            build: Box::new(build),
        })
    }
}

#[async_trait]
impl WorkerFactory for InMemoryFactory {
    async fn spawn(
        &self,
        _worker_id: WorkerId,
        _overrides: WorkerSpawnOverrides,
    ) -> Result<(Arc<dyn WorkerChannel>, ChannelEvents), PoolError> {
        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel::<Envelope>();
        let (events_tx, events_rx) = channel_events();
        let dispatcher = (self.build)();
        let transport = InMemoryTransport {
            from_pool: to_worker_rx,
            to_pool: events_tx.clone(),
        };
        tokio::spawn(async move {
            let outcome = dispatcher.serve(transport).await;
            let code = match outcome {
                ServeOutcome::TerminatedGracefully => Some(0),
                _ => Some(1),
            };
            let _ = events_tx.send(ChannelEvent::Exit { code, signal: None });
        });
        let channel = InMemoryChannel { to_worker: to_worker_tx };
        Ok((Arc::new(channel), events_rx))
    }
}
