//! Concrete `WorkerChannel` over an OS child process, plus the
//! worker-side stdio entry point a worker binary hands its
//! [`forgepool_core::Dispatcher`] to.
//!
//! Framing: one [`Envelope`] per newline-delimited JSON line in each
//! direction. The envelope protocol itself is framing-agnostic — this
//! crate picks NDJSON because it is trivially debuggable over a pipe
//! and needs no extra dependency beyond `serde_json`, which the core
//! already carries.

use async_trait::async_trait;
use bytes::Bytes;
use forgepool_core::channel::{channel_events, ChannelClosed, ChannelEvent, ChannelEvents};
use forgepool_core::dispatcher::{Dispatcher, DispatcherTransport, ServeOutcome};
use forgepool_core::envelope::Envelope;
use forgepool_core::error::PoolError;
use forgepool_core::pool::{WorkerFactory, WorkerSpawnOverrides};
use forgepool_core::worker_handle::WorkerId;
use forgepool_core::WorkerChannel;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

/// Identifies the worker binary (and any fixed args) launched for every
/// spawned process.
#[derive(Clone, Debug)]
pub struct WorkerScript {
    program: String,
    args: Vec<String>,
}

impl WorkerScript {
    pub fn new(program: impl Into<String>) -> Self {
        WorkerScript {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// [`WorkerFactory`] that launches [`WorkerScript::program`] as a child
/// process per worker, applying [`WorkerSpawnOverrides`] from
/// `PoolConfig::on_create_worker` as extra args/env merged into the
/// spawn parameters.
pub struct ProcessWorkerFactory {
    script: WorkerScript,
}

impl ProcessWorkerFactory {
    pub fn new(script: WorkerScript) -> Arc<Self> {
        Arc::new(ProcessWorkerFactory { script })
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn spawn(
        &self,
        worker_id: WorkerId,
        overrides: WorkerSpawnOverrides,
    ) -> Result<(Arc<dyn WorkerChannel>, ChannelEvents), PoolError> {
        let mut command = Command::new(&self.script.program);
        command
            .args(&self.script.args)
            .args(&overrides.args)
            .envs(overrides.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| PoolError::Protocol(format!("spawn worker {worker_id}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .expect("stdin piped above");
        let stdout = child
            .stdout
            .take()
            .expect("stdout piped above");

        let (events_tx, events_rx) = channel_events();
        let reader_tx = events_tx.clone();
        let channel_events_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Envelope>(&line) {
                            Ok(envelope) => {
                                if reader_tx.send(ChannelEvent::Message(envelope)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(worker_id, %err, "malformed envelope from worker");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(worker_id, %err, "error reading worker stdout");
                        break;
                    }
                }
            }
        });

        let child = Arc::new(AsyncMutex::new(child));
        let wait_child = child.clone();
        tokio::spawn(async move {
            let status = wait_child.lock().await.wait().await;
            let code = status.ok().and_then(|s| s.code());
            let _ = events_tx.send(ChannelEvent::Exit { code, signal: None });
        });

        let channel = ProcessWorkerChannel {
            worker_id,
            stdin: AsyncMutex::new(stdin),
            child,
            events: channel_events_tx,
        };
        Ok((Arc::new(channel), events_rx))
    }
}

/// The pool-side half of one worker process's duplex channel.
struct ProcessWorkerChannel {
    worker_id: WorkerId,
    stdin: AsyncMutex<ChildStdin>,
    child: Arc<AsyncMutex<Child>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[async_trait]
impl WorkerChannel for ProcessWorkerChannel {
    async fn send(&self, envelope: Envelope, transfer: Vec<Bytes>) -> Result<(), ChannelClosed> {
        // A pipe has no ownership-transfer primitive; every transferable
        // region is inlined into the envelope's JSON and so is, in
        // effect, copied and recorded as degraded. `transfer` itself
        // carries nothing extra to send here because `Value::Bytes`
        // already embeds the bytes.
        let degraded = transfer.len() as u32;
        let mut line = serde_json::to_vec(&envelope).map_err(|_| ChannelClosed)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await.map_err(|_| ChannelClosed)?;
        stdin.flush().await.map_err(|_| ChannelClosed)?;
        drop(stdin);
        if degraded > 0 {
            tracing::debug!(worker_id = self.worker_id, degraded, "transfer degraded to copy");
            let _ = self.events.send(ChannelEvent::TransferDegraded { count: degraded });
        }
        Ok(())
    }

    async fn terminate(&self, force: bool) {
        if force {
            let mut child = self.child.lock().await;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        // Graceful termination is driven entirely by the
        // TERMINATE_REQUEST/TERMINATE_ACK envelope exchange; the worker
        // exits on its own and the reader task above turns that into a
        // `ChannelEvent::Exit`.
    }
}

impl std::fmt::Debug for ProcessWorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorkerChannel")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Worker-side half: reads/writes newline-delimited envelopes over this
/// process's own stdin/stdout.
struct StdioTransport {
    stdin: BufReader<tokio::io::Stdin>,
    stdout: tokio::io::Stdout,
}

impl StdioTransport {
    fn new() -> Self {
        StdioTransport {
            stdin: BufReader::new(tokio::io::stdin()),
            stdout: tokio::io::stdout(),
        }
    }
}

#[async_trait]
impl DispatcherTransport for StdioTransport {
    async fn recv(&mut self) -> Option<Envelope> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.stdin.read_line(&mut line).await {
                Ok(0) => return None,
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str(&line) {
                        Ok(envelope) => return Some(envelope),
                        Err(err) => {
                            tracing::warn!(%err, "malformed envelope from pool");
                            continue;
                        }
                    }
                }
                Err(_) => return None,
            }
        }
    }

    async fn send(&mut self, envelope: Envelope) -> Result<(), ChannelClosed> {
        let mut line = serde_json::to_vec(&envelope).map_err(|_| ChannelClosed)?;
        line.push(b'\n');
        self.stdout.write_all(&line).await.map_err(|_| ChannelClosed)?;
        self.stdout.flush().await.map_err(|_| ChannelClosed)
    }
}

/// Runs `dispatcher` against this process's stdin/stdout until the pool
/// terminates it, then exits the process. The serve loop owns the
/// worker's lifetime; there is nothing meaningful to return to after it
/// ends.
pub async fn run_worker(dispatcher: Dispatcher) -> ! {
    let transport = StdioTransport::new();
    match dispatcher.serve(transport).await {
        ServeOutcome::TerminatedGracefully => std::process::exit(0),
        ServeOutcome::TransportClosed => std::process::exit(1),
        ServeOutcome::AbortTimeoutExit { .. } => std::process::exit(1),
    }
}
