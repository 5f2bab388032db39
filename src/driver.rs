//! Driver task that owns the upstream socket

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, FrameCheck};
use crate::config::{TimingConfig, UpstreamConfig};
use crate::connection::state::{ConnectionState, Effect, Event, SocketProbe};
use crate::connection::timers::{TimerCensus, TimerFired, TimerSet};
use crate::provider::TargetProvider;
use crate::types::{ConnectionPhase, FramePacket, Message, TcpStatus};
use crate::{RelayError, Result};

const READ_CHUNK: usize = 4096;
const COMMAND_QUEUE: usize = 256;
const TIMER_QUEUE: usize = 16;
/// Writes accepted for one socket before callers see `WriteBacklog`
pub(crate) const WRITE_QUEUE: usize = 64;
const FAILURE_QUEUE: usize = 4;
/// Status transitions a slow subscriber may fall behind by before lagging
const STATUS_EVENTS: usize = 32;

/// Liveness check run on each health-check tick
pub(crate) type ProbeFn = fn(&SocketLink) -> SocketProbe;

/// Requests from [`UpstreamConnection`](crate::connection::UpstreamConnection) handles.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue `payload` for the socket writer if connected
    Write { payload: Bytes, reply: oneshot::Sender<Result<()>> },
    /// Tear down; replies once the socket is gone
    Shutdown { reply: oneshot::Sender<()> },
}

/// Result of spawning the driver task
pub(crate) struct DriverChannels {
    pub commands: mpsc::Sender<Command>,
    pub status: watch::Receiver<TcpStatus>,
    pub status_events: broadcast::Sender<TcpStatus>,
    pub phase: watch::Receiver<ConnectionPhase>,
    pub frames: watch::Receiver<Option<Arc<FramePacket>>>,
    pub census: Arc<TimerCensus>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Spawns and runs the task that owns the upstream socket.
///
/// The task is the only place the socket and [`ConnectionState`] are touched.
/// Handles talk to it through a command queue and timers post into a second
/// queue. Socket reads and connect results are polled directly. Writes are
/// handed to a per-socket writer task and never block the loop; the writer
/// reports its failure back on a third queue.
pub(crate) struct Driver<P> {
    provider: P,
    upstream: UpstreamConfig,
    state: ConnectionState,
    timers: TimerSet,
    link: Option<SocketLink>,
    next_link: u64,
    failures: mpsc::Sender<WriteFailure>,
    probe: ProbeFn,
    connecting: Option<JoinHandle<Result<TcpStream>>>,
    connect_timeout: Duration,
    status_tx: watch::Sender<TcpStatus>,
    status_events: broadcast::Sender<TcpStatus>,
    phase_tx: watch::Sender<ConnectionPhase>,
    frame_tx: watch::Sender<Option<Arc<FramePacket>>>,
    frame_count: u64,
}

impl<P> Driver<P>
where
    P: TargetProvider,
{
    /// Spawn the driver task and start connecting immediately.
    pub fn spawn(
        provider: P,
        upstream: UpstreamConfig,
        timing: TimingConfig,
        probe: ProbeFn,
    ) -> DriverChannels {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_QUEUE);
        let (failure_tx, failure_rx) = mpsc::channel(FAILURE_QUEUE);
        let (status_tx, status_rx) = watch::channel(TcpStatus::default());
        let (status_events, _) = broadcast::channel(STATUS_EVENTS);
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Disconnected);
        let (frame_tx, frame_rx) = watch::channel(None);

        let timers = TimerSet::new(timer_tx);
        let census = timers.census();
        let cancel = CancellationToken::new();

        let driver = Driver {
            provider,
            upstream,
            state: ConnectionState::new(timing),
            timers,
            link: None,
            next_link: 0,
            failures: failure_tx,
            probe,
            connecting: None,
            connect_timeout: timing.connect_timeout(),
            status_tx,
            status_events: status_events.clone(),
            phase_tx,
            frame_tx,
            frame_count: 0,
        };

        let task = tokio::spawn(driver.run(command_rx, timer_rx, failure_rx, cancel.clone()));

        DriverChannels {
            commands: command_tx,
            status: status_rx,
            status_events,
            phase: phase_rx,
            frames: frame_rx,
            census,
            cancel,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut timer_rx: mpsc::Receiver<TimerFired>,
        mut failures: mpsc::Receiver<WriteFailure>,
        cancel: CancellationToken,
    ) {
        info!(provider = %self.provider.describe(), "Upstream driver started");
        self.apply(Event::Start).await;

        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Upstream driver cancelled");
                    self.apply(Event::Shutdown).await;
                    break;
                }
                command = commands.recv() => match command {
                    Some(Command::Write { payload, reply }) => {
                        let _ = reply.send(self.write(payload));
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.apply(Event::Shutdown).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        debug!("All connection handles dropped");
                        self.apply(Event::Shutdown).await;
                        break;
                    }
                },
                Some(fired) = timer_rx.recv() => self.on_timer(fired).await,
                Some(failure) = failures.recv() => self.on_write_failure(failure).await,
                outcome = next_connect(&mut self.connecting) => self.on_connect(outcome).await,
                read = read_socket(&mut self.link, &mut buf) => {
                    self.on_read(read, &mut buf).await;
                }
            }
        }

        info!("Upstream driver ended (received {} frames)", self.frame_count);
    }

    /// Feed `event` to the state machine and carry out the resulting effects,
    /// including any events those effects produce.
    async fn apply(&mut self, event: Event) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            trace!(?event, phase = %self.state.phase(), "Applying event");
            let effects = self.state.handle(event, Instant::now());

            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    pending.push_back(follow_up);
                }
            }
        }

        self.phase_tx.send_if_modified(|phase| {
            let changed = *phase != self.state.phase();
            *phase = self.state.phase();
            changed
        });
    }

    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Connect => return self.start_connect().await,
            Effect::AbortConnect => {
                if let Some(attempt) = self.connecting.take() {
                    attempt.abort();
                }
            }
            Effect::ArmTimer { kind, period } => {
                self.timers.arm(kind, period);
            }
            Effect::CancelTimer(kind) => {
                self.timers.cancel(kind);
            }
            Effect::EmitStatus(status) => {
                debug!(connected = status.connected, error = ?status.error, "Status changed");
                let _ = self.status_events.send(status.clone());
                self.status_tx.send_replace(status);
            }
            Effect::SendHeartbeat { counter } => {
                let heartbeat =
                    Message::heartbeat(self.upstream.heartbeat_user_id, counter, now_millis());
                if let Some(link) = &self.link {
                    trace!(counter, "Sending heartbeat");
                    let frame = Bytes::copy_from_slice(&heartbeat.encode());
                    if let Err(TrySendError::Full(_)) = link.writes.try_send(frame) {
                        debug!(counter, "Heartbeat skipped, upstream write queue full");
                    }
                }
            }
            Effect::CloseSocket => {
                if let Some(link) = self.link.take() {
                    debug!(link = link.id, "Upstream socket closed");
                }
            }
        }
        None
    }

    async fn start_connect(&mut self) -> Option<Event> {
        if let Some(previous) = self.connecting.take() {
            previous.abort();
        }

        let target = match self.provider.next_target().await {
            Ok(target) => target,
            Err(e) => return Some(Event::ConnectFailed { error: describe(&e) }),
        };

        info!(%target, "Connecting to upstream");
        let timeout = self.connect_timeout;
        self.connecting = Some(tokio::spawn(open_socket(target, timeout)));
        None
    }

    async fn on_connect(&mut self, outcome: Result<TcpStream>) {
        match outcome {
            Ok(stream) => {
                if let Ok(peer) = stream.peer_addr() {
                    info!(%peer, "Upstream socket open");
                }
                self.next_link += 1;
                self.link = Some(SocketLink::open(self.next_link, stream, self.failures.clone()));
                self.apply(Event::Connected).await;
            }
            Err(e) => self.apply(Event::ConnectFailed { error: describe(&e) }).await,
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        use crate::connection::timers::TimerKind;

        if !self.timers.accept(fired) {
            return;
        }

        let event = match fired.kind {
            TimerKind::Heartbeat => Event::HeartbeatDue,
            TimerKind::HealthCheck => {
                let probe = self.link.as_ref().map_or(SocketProbe::DEAD, self.probe);
                Event::HealthCheckDue { probe }
            }
            TimerKind::Reconnect => Event::ReconnectDue,
        };
        self.apply(event).await;
    }

    async fn on_read(&mut self, read: std::io::Result<usize>, buf: &mut BytesMut) {
        match read {
            Ok(0) => self.apply(Event::Closed { error: None }).await,
            Ok(n) => {
                // Each read is one snapshot; no reassembly across reads
                let chunk = buf.split().freeze();
                self.frame_count += 1;

                match codec::decode_with(&chunk, self.upstream.frame_check) {
                    Ok(message) => trace!(
                        bytes = n,
                        kind = message.kind,
                        user_id = message.user_id,
                        "Upstream frame"
                    ),
                    Err(e) if self.upstream.frame_check == FrameCheck::Strict => {
                        debug!("Discarding inbound chunk: {}", e);
                        self.apply(Event::DataReceived).await;
                        return;
                    }
                    Err(e) => trace!(bytes = n, "Inbound chunk is not a whole frame: {}", e),
                }

                let packet = FramePacket::new(chunk, self.frame_count);
                self.frame_tx.send_replace(Some(Arc::new(packet)));
                self.apply(Event::DataReceived).await;
            }
            Err(e) => {
                error!("Upstream read failed: {}", e);
                self.apply(Event::Closed { error: Some(e.to_string()) }).await;
            }
        }
    }

    async fn on_write_failure(&mut self, failure: WriteFailure) {
        if self.link.as_ref().map(|link| link.id) != Some(failure.link) {
            trace!(link = failure.link, "Ignoring write failure from a closed socket");
            return;
        }
        error!("Upstream write failed: {}", failure.error);
        self.apply(Event::Closed { error: Some(failure.error.to_string()) }).await;
    }

    /// Hand `payload` to the socket writer without waiting for it to be sent.
    fn write(&mut self, payload: Bytes) -> Result<()> {
        let link = match &self.link {
            Some(link) if self.state.can_write() => link,
            _ => {
                warn!(
                    bytes = payload.len(),
                    phase = %self.state.phase(),
                    "TCP not connected, cannot forward"
                );
                return Err(RelayError::WriteWhileDisconnected);
            }
        };

        trace!(bytes = payload.len(), "Forwarding to upstream");
        link.writes.try_send(payload).map_err(|e| match e {
            TrySendError::Full(payload) => {
                warn!(bytes = payload.len(), "Upstream write queue full, dropping command");
                RelayError::WriteBacklog { depth: WRITE_QUEUE }
            }
            TrySendError::Closed(_) => RelayError::WriteWhileDisconnected,
        })
    }
}

/// An open upstream socket.
///
/// The driver reads from `reader`; `writer` owns the write half and drains
/// `writes`. Dropping the link aborts the writer, which closes the socket.
pub(crate) struct SocketLink {
    id: u64,
    reader: OwnedReadHalf,
    writes: mpsc::Sender<Bytes>,
    writer: JoinHandle<()>,
}

impl SocketLink {
    fn open(id: u64, stream: TcpStream, failures: mpsc::Sender<WriteFailure>) -> Self {
        let (reader, half) = stream.into_split();
        let (writes, queue) = mpsc::channel(WRITE_QUEUE);
        let writer = tokio::spawn(write_loop(id, half, queue, failures));
        Self { id, reader, writes, writer }
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

/// A write half that failed, tagged with the link it belonged to
#[derive(Debug)]
pub(crate) struct WriteFailure {
    link: u64,
    error: std::io::Error,
}

async fn write_loop(
    link: u64,
    mut half: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    failures: mpsc::Sender<WriteFailure>,
) {
    while let Some(bytes) = queue.recv().await {
        if let Err(error) = half.write_all(&bytes).await {
            let _ = failures.send(WriteFailure { link, error }).await;
            return;
        }
    }
}

/// Readable while the socket still has a peer; writable while the writer is
/// also running. Neither check consumes a pending socket error.
pub(crate) fn probe_socket(link: &SocketLink) -> SocketProbe {
    let readable = link.reader.peer_addr().is_ok();
    SocketProbe { readable, writable: readable && !link.writer.is_finished() }
}

/// Resolve `target` and connect with keep-alive enabled.
async fn open_socket(target: String, timeout: Duration) -> Result<TcpStream> {
    let attempt = async {
        let addrs = tokio::net::lookup_host(&target).await.map_err(|e| {
            RelayError::connect_failure_with_source(target.clone(), Box::new(e))
        })?;

        let mut last_error = None;
        for addr in addrs {
            let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }
                .map_err(|e| RelayError::io("creating socket", e))?;
            socket.set_keepalive(true).map_err(|e| RelayError::io("enabling keep-alive", e))?;

            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(|e| RelayError::io("setting nodelay", e))?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, "Connect failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => RelayError::connect_failure_with_source(target.clone(), Box::new(e)),
            None => RelayError::connect_failure(format!("{target} (no addresses)")),
        })
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .unwrap_or(Err(RelayError::Timeout { duration: timeout }))
}

async fn next_connect(slot: &mut Option<JoinHandle<Result<TcpStream>>>) -> Result<TcpStream> {
    if let Some(attempt) = slot.as_mut() {
        let joined = attempt.await;
        *slot = None;
        return joined
            .unwrap_or_else(|e| Err(RelayError::connect_failure(format!("connect task: {e}"))));
    }
    std::future::pending().await
}

async fn read_socket(
    link: &mut Option<SocketLink>,
    buf: &mut BytesMut,
) -> std::io::Result<usize> {
    match link.as_mut() {
        Some(link) => {
            buf.reserve(READ_CHUNK);
            link.reader.read_buf(buf).await
        }
        None => std::future::pending().await,
    }
}

/// Error text for status events, including the underlying cause.
fn describe(error: &RelayError) -> String {
    use std::error::Error;

    match error.source() {
        Some(source) => format!("{error}: {source}"),
        None => error.to_string(),
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
