use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use treesync_core::{
    ByteStream, ConnectionParams, Connector, RemoteConnection, RemoteEntry, RemoteError,
};

/// Slots kept on top of the worker concurrency for one-off commands issued
/// outside the worker pool (connectivity probe, hash verification downloads).
pub const RESERVE_SLOTS: usize = 5;

pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum Verb {
    List { path: String },
    Retrieve { path: String },
    Store { source: PathBuf, path: String },
    Delete { path: String },
    MakeDir { path: String },
    RemoveDir { path: String },
}

/// Per-command override of the pool defaults, used for one-off probes.
#[derive(Debug, Clone, Default)]
pub struct TransientParams {
    pub connection: Option<ConnectionParams>,
    pub request_timeout: Option<Duration>,
    pub retry_limit: Option<u32>,
}

#[derive(Clone)]
pub struct Command {
    pub verb: Verb,
    pub progress: Option<ProgressFn>,
    pub transient: Option<TransientParams>,
}

impl Command {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            progress: None,
            transient: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_transient(mut self, transient: TransientParams) -> Self {
        self.transient = Some(transient);
        self
    }
}

#[derive(Debug)]
pub enum Reply {
    Entries(Vec<RemoteEntry>),
    Data(Vec<u8>),
    Done,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("could not obtain the response data stream")]
    StreamUnavailable,
    #[error("reply body broke off or was malformed")]
    MalformedReply,
    #[error("request retry limit exhausted")]
    RetriesExhausted,
    #[error("request timed out")]
    RequestTimeout,
    #[error("transfer stalled past the idle timeout")]
    TransferTimeout,
    #[error("connection was force-closed")]
    ForcedClose,
    #[error("transport error: {0}")]
    Connection(String),
    #[error("local source unreadable: {0}")]
    LocalIo(String),
    #[error("server replied {code}: {message}")]
    Reply { code: u16, message: String },
}

impl CommandError {
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            CommandError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connection: ConnectionParams,
    /// Worker concurrency; the pool itself holds `num_workers + RESERVE_SLOTS`.
    pub num_workers: usize,
    /// Attempts per command before it settles as `RetriesExhausted`.
    pub retry_limit: u32,
    pub request_timeout: Duration,
    /// Idle limit between transfer chunks; distinguishes a stalled transfer
    /// from a slow one.
    pub transfer_timeout: Duration,
}

/// Multiplexes pending remote commands over a fixed set of persistent
/// connection slots. All state lives in a single event-loop task; spawned
/// attempts report back over the same channel, so every submission and
/// every settlement re-runs the FIFO scheduling pass.
pub struct CommandPool<C: Connector> {
    tx: mpsc::UnboundedSender<PoolEvent<C::Conn>>,
}

impl<C: Connector> Clone for CommandPool<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: Connector> CommandPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let slots = (0..config.num_workers + RESERVE_SLOTS)
            .map(|_| Slot::idle())
            .collect();
        let task = PoolTask {
            connector: Arc::new(connector),
            config,
            slots,
            pending: BTreeMap::new(),
            next_id: 0,
            rx,
            tx: tx.clone(),
        };
        tokio::spawn(task.run());
        Self { tx }
    }

    pub async fn submit(&self, command: Command) -> Result<Reply, CommandError> {
        let (settle, settled) = oneshot::channel();
        if self
            .tx
            .send(PoolEvent::Submit { command, settle })
            .is_err()
        {
            return Err(CommandError::ForcedClose);
        }
        settled.await.unwrap_or(Err(CommandError::ForcedClose))
    }

    /// Replace the default connection parameters (e.g. once an interactively
    /// entered password has been validated). Takes effect for connections
    /// established after the event is processed.
    pub fn set_connection(&self, connection: ConnectionParams) {
        let _ = self.tx.send(PoolEvent::SetConnection(connection));
    }

    /// Force-destroy every slot and stop the scheduler. Anything still
    /// pending settles with the forced-close sentinel, as do later submits.
    pub async fn close_all(&self) {
        let (done, closed) = oneshot::channel();
        if self.tx.send(PoolEvent::CloseAll { done }).is_ok() {
            let _ = closed.await;
        }
    }
}

enum PoolEvent<Conn> {
    Submit {
        command: Command,
        settle: oneshot::Sender<Result<Reply, CommandError>>,
    },
    Settled {
        id: u64,
        slot: usize,
        outcome: AttemptOutcome<Conn>,
    },
    SetConnection(ConnectionParams),
    CloseAll {
        done: oneshot::Sender<()>,
    },
}

struct AttemptOutcome<Conn> {
    result: Result<Reply, AttemptError>,
    /// Surviving connection to park back in the slot; `None` when the
    /// attempt destroyed it.
    conn: Option<Conn>,
}

enum AttemptError {
    /// Connection-fatal failure, re-queued until the retry budget runs out.
    Transport(CommandError),
    /// Settles the command immediately (protocol replies, download stalls,
    /// connect failures); any further retry belongs to the action layer.
    Terminal(CommandError),
}

struct Pending {
    command: Command,
    tries: u32,
    slot: Option<usize>,
    settle: oneshot::Sender<Result<Reply, CommandError>>,
}

struct Slot<Conn> {
    conn: Option<Conn>,
    assigned: Option<u64>,
    faulted: bool,
}

impl<Conn> Slot<Conn> {
    fn idle() -> Self {
        Self {
            conn: None,
            assigned: None,
            faulted: false,
        }
    }
}

struct PoolTask<C: Connector> {
    connector: Arc<C>,
    config: PoolConfig,
    slots: Vec<Slot<C::Conn>>,
    pending: BTreeMap<u64, Pending>,
    next_id: u64,
    rx: mpsc::UnboundedReceiver<PoolEvent<C::Conn>>,
    tx: mpsc::UnboundedSender<PoolEvent<C::Conn>>,
}

impl<C: Connector> PoolTask<C> {
    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                PoolEvent::Submit { command, settle } => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.pending.insert(
                        id,
                        Pending {
                            command,
                            tries: 0,
                            slot: None,
                            settle,
                        },
                    );
                    self.schedule();
                }
                PoolEvent::Settled { id, slot, outcome } => {
                    self.settle(id, slot, outcome);
                    self.schedule();
                }
                PoolEvent::SetConnection(connection) => {
                    self.config.connection = connection;
                }
                PoolEvent::CloseAll { done } => {
                    self.close_all();
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    /// One scheduling pass: assign unassigned pending commands, in
    /// submission order, to free non-faulted slots. Safe to call with no
    /// pending work.
    fn schedule(&mut self) {
        let unassigned: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.slot.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in unassigned {
            let Some(free) = self
                .slots
                .iter()
                .position(|slot| !slot.faulted && slot.assigned.is_none())
            else {
                break;
            };
            self.assign(id, free);
        }
    }

    fn assign(&mut self, id: u64, slot_index: usize) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        pending.tries += 1;
        pending.slot = Some(slot_index);
        let command = pending.command.clone();
        let slot = &mut self.slots[slot_index];
        slot.assigned = Some(id);
        let conn = slot.conn.take();

        let transient = command.transient.as_ref();
        let attempt = Attempt {
            connector: Arc::clone(&self.connector),
            params: transient
                .and_then(|t| t.connection.clone())
                .unwrap_or_else(|| self.config.connection.clone()),
            request_timeout: transient
                .and_then(|t| t.request_timeout)
                .unwrap_or(self.config.request_timeout),
            transfer_timeout: self.config.transfer_timeout,
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = attempt.run(conn, command).await;
            let _ = tx.send(PoolEvent::Settled {
                id,
                slot: slot_index,
                outcome,
            });
        });
    }

    fn settle(&mut self, id: u64, slot_index: usize, outcome: AttemptOutcome<C::Conn>) {
        if let Some(slot) = self.slots.get_mut(slot_index) {
            slot.assigned = None;
            slot.conn = outcome.conn;
        }
        let Some(mut pending) = self.pending.remove(&id) else {
            return;
        };
        match outcome.result {
            Ok(reply) => {
                let _ = pending.settle.send(Ok(reply));
            }
            Err(AttemptError::Terminal(err)) => {
                let _ = pending.settle.send(Err(err));
            }
            Err(AttemptError::Transport(_)) => {
                if let Some(slot) = self.slots.get_mut(slot_index) {
                    slot.conn = None;
                }
                let limit = pending
                    .command
                    .transient
                    .as_ref()
                    .and_then(|t| t.retry_limit)
                    .unwrap_or(self.config.retry_limit)
                    .max(1);
                if pending.tries < limit {
                    pending.slot = None;
                    self.pending.insert(id, pending);
                } else {
                    let _ = pending.settle.send(Err(CommandError::RetriesExhausted));
                }
            }
        }
    }

    fn close_all(&mut self) {
        for slot in &mut self.slots {
            slot.faulted = true;
            slot.assigned = None;
            slot.conn = None;
        }
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.settle.send(Err(CommandError::ForcedClose));
        }
    }
}

struct Attempt<C: Connector> {
    connector: Arc<C>,
    params: ConnectionParams,
    request_timeout: Duration,
    transfer_timeout: Duration,
}

/// `(error, keep_connection)` for a remote failure.
fn classify(err: RemoteError) -> (AttemptError, bool) {
    let keep = !err.is_connection_fatal();
    match err {
        RemoteError::Reply { code, message } => {
            (AttemptError::Terminal(CommandError::Reply { code, message }), keep)
        }
        RemoteError::Url(err) => (
            AttemptError::Terminal(CommandError::Connection(err.to_string())),
            keep,
        ),
        other => (
            AttemptError::Transport(CommandError::Connection(other.to_string())),
            false,
        ),
    }
}

impl<C: Connector> Attempt<C> {
    async fn run(self, conn: Option<C::Conn>, command: Command) -> AttemptOutcome<C::Conn> {
        let mut conn = match conn {
            Some(conn) => conn,
            None => {
                // Lazy activation under the request timeout. A connect
                // failure settles the assigned command; the action layer
                // owns any further retry.
                match tokio::time::timeout(self.request_timeout, self.connector.connect(&self.params))
                    .await
                {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(err)) => {
                        let (err, _) = classify(err);
                        let err = match err {
                            AttemptError::Transport(inner) | AttemptError::Terminal(inner) => inner,
                        };
                        return AttemptOutcome {
                            result: Err(AttemptError::Terminal(err)),
                            conn: None,
                        };
                    }
                    Err(_) => {
                        return AttemptOutcome {
                            result: Err(AttemptError::Terminal(CommandError::RequestTimeout)),
                            conn: None,
                        };
                    }
                }
            }
        };

        match self.execute(&mut conn, command).await {
            Ok(reply) => AttemptOutcome {
                result: Ok(reply),
                conn: Some(conn),
            },
            Err((err, keep)) => AttemptOutcome {
                result: Err(err),
                conn: keep.then_some(conn),
            },
        }
    }

    async fn execute(
        &self,
        conn: &mut C::Conn,
        command: Command,
    ) -> Result<Reply, (AttemptError, bool)> {
        match command.verb {
            Verb::List { path } => {
                let entries = self.timed(conn.list(&path)).await?;
                Ok(Reply::Entries(entries))
            }
            Verb::Delete { path } => {
                self.timed(conn.delete_file(&path)).await?;
                Ok(Reply::Done)
            }
            Verb::MakeDir { path } => {
                self.timed(conn.make_dir(&path)).await?;
                Ok(Reply::Done)
            }
            Verb::RemoveDir { path } => {
                self.timed(conn.remove_dir(&path)).await?;
                Ok(Reply::Done)
            }
            Verb::Retrieve { path } => {
                let stream = match self.timed(conn.retrieve(&path)).await {
                    Ok(stream) => stream,
                    Err((AttemptError::Transport(_), keep)) => {
                        return Err((
                            AttemptError::Transport(CommandError::StreamUnavailable),
                            keep,
                        ));
                    }
                    Err(other) => return Err(other),
                };
                self.drain(stream, command.progress.as_ref()).await
            }
            Verb::Store { source, path } => {
                self.upload(conn, &source, &path, command.progress).await
            }
        }
    }

    /// A single timer spans dispatch to reply for non-stream operations.
    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, (AttemptError, bool)> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err((
                AttemptError::Transport(CommandError::RequestTimeout),
                false,
            )),
        }
    }

    /// Drain a reply stream under the per-chunk idle-timeout discipline. A
    /// stall settles the command terminally and destroys the connection.
    async fn drain(
        &self,
        mut stream: ByteStream,
        progress: Option<&ProgressFn>,
    ) -> Result<Reply, (AttemptError, bool)> {
        let mut data = Vec::new();
        loop {
            match tokio::time::timeout(self.transfer_timeout, stream.next()).await {
                Err(_) => {
                    return Err((
                        AttemptError::Terminal(CommandError::TransferTimeout),
                        false,
                    ));
                }
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => {
                    if let Some(progress) = progress {
                        progress(chunk.len() as u64);
                    }
                    data.extend_from_slice(&chunk);
                }
                Ok(Some(Err(_))) => {
                    // the body broke off mid-reply; transport, so the
                    // scheduler re-queues it on a fresh connection
                    return Err((
                        AttemptError::Transport(CommandError::MalformedReply),
                        false,
                    ));
                }
            }
        }
        Ok(Reply::Data(data))
    }

    /// Stream the local source; the idle watchdog resets on every chunk
    /// read, so a stalled upload is a transport failure (re-queued) while a
    /// slow one keeps going.
    async fn upload(
        &self,
        conn: &mut C::Conn,
        source: &Path,
        path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Reply, (AttemptError, bool)> {
        let file = match tokio::fs::File::open(source).await {
            Ok(file) => file,
            Err(err) => {
                return Err((
                    AttemptError::Transport(CommandError::LocalIo(err.to_string())),
                    true,
                ));
            }
        };
        let len = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(err) => {
                return Err((
                    AttemptError::Transport(CommandError::LocalIo(err.to_string())),
                    true,
                ));
            }
        };

        let started = Instant::now();
        let activity = Arc::new(AtomicU64::new(0));
        let tick = Arc::clone(&activity);
        let body: ByteStream = ReaderStream::new(file)
            .map(move |chunk| match chunk {
                Ok(chunk) => {
                    tick.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    if let Some(progress) = &progress {
                        progress(chunk.len() as u64);
                    }
                    Ok(chunk)
                }
                Err(err) => Err(RemoteError::Io(err)),
            })
            .boxed();

        let put = conn.store(path, body, len);
        tokio::pin!(put);
        loop {
            let last = Duration::from_millis(activity.load(Ordering::Relaxed));
            let idle = started.elapsed().saturating_sub(last);
            if idle >= self.transfer_timeout {
                return Err((
                    AttemptError::Transport(CommandError::TransferTimeout),
                    false,
                ));
            }
            tokio::select! {
                result = &mut put => {
                    return match result {
                        Ok(()) => Ok(Reply::Done),
                        Err(err) => Err(classify(err)),
                    };
                }
                _ = tokio::time::sleep(self.transfer_timeout - idle) => {}
            }
        }
    }
}
