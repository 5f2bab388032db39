//! Handle to the upstream controller connection

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{RelayConfig, TimingConfig, UpstreamConfig};
use crate::connection::timers::TimerCensus;
use crate::driver::{self, Command, Driver, ProbeFn};
use crate::provider::TargetProvider;
use crate::providers::FixedTarget;
use crate::types::{ConnectionPhase, FramePacket, TcpStatus};
use crate::{RelayError, Result};

/// The single connection to the crane controller.
///
/// Connecting starts on [`spawn`](Self::spawn) and is retried forever with a
/// fixed delay until [`shutdown`](Self::shutdown) is called or the handle is
/// dropped. Each inbound read replaces the latest-frame slot.
pub struct UpstreamConnection {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<TcpStatus>,
    status_events: broadcast::Sender<TcpStatus>,
    phase: watch::Receiver<ConnectionPhase>,
    frames: watch::Receiver<Option<Arc<FramePacket>>>,
    census: Arc<TimerCensus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamConnection {
    /// Start the driver with a custom target provider.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<P>(provider: P, upstream: UpstreamConfig, timing: TimingConfig) -> Self
    where
        P: TargetProvider,
    {
        Self::spawn_with_probe(provider, upstream, timing, driver::probe_socket)
    }

    /// Start the driver with a custom liveness check for health-check ticks.
    pub(crate) fn spawn_with_probe<P>(
        provider: P,
        upstream: UpstreamConfig,
        timing: TimingConfig,
        probe: ProbeFn,
    ) -> Self
    where
        P: TargetProvider,
    {
        let channels = Driver::spawn(provider, upstream, timing, probe);

        Self {
            commands: channels.commands,
            status: channels.status,
            status_events: channels.status_events,
            phase: channels.phase,
            frames: channels.frames,
            census: channels.census,
            cancel: channels.cancel,
            task: Mutex::new(Some(channels.task)),
        }
    }

    /// Connect to the target named in `config`, without file reloads.
    pub fn connect(config: &RelayConfig) -> Self {
        let provider = FixedTarget::new(config.upstream.target());
        Self::spawn(provider, config.upstream.clone(), config.timing)
    }

    /// Write `payload` to the controller verbatim.
    ///
    /// Returns once the payload is queued on the open socket, without waiting
    /// for the controller to read it. A failed write closes the connection and
    /// shows up as a status change. Fails with
    /// [`RelayError::WriteWhileDisconnected`] unless the connection is
    /// currently established, and with [`RelayError::WriteBacklog`] when the
    /// socket already has a full queue; nothing is kept for a later connection.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.phase().is_writable() {
            return Err(RelayError::WriteWhileDisconnected);
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Write { payload, reply })
            .await
            .map_err(|_| RelayError::WriteWhileDisconnected)?;

        response.await.map_err(|_| RelayError::WriteWhileDisconnected)?
    }

    /// Current connection status
    pub fn status(&self) -> TcpStatus {
        self.status.borrow().clone()
    }

    /// Status changes, starting with the current value
    pub fn status_updates(&self) -> impl Stream<Item = TcpStatus> + 'static {
        WatchStream::new(self.status.clone())
    }

    /// Every status transition from now on, in order.
    ///
    /// Unlike [`subscribe_status`](Self::subscribe_status), intermediate
    /// transitions are kept; a receiver that falls far behind gets `Lagged`.
    pub fn status_events(&self) -> broadcast::Receiver<TcpStatus> {
        self.status_events.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TcpStatus> {
        self.status.clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.clone()
    }

    /// The latest-frame slot
    pub fn frames(&self) -> watch::Receiver<Option<Arc<FramePacket>>> {
        self.frames.clone()
    }

    /// Frames as they replace each other in the slot.
    ///
    /// Slow consumers see only the most recent frame.
    pub fn frame_updates(&self) -> impl Stream<Item = Arc<FramePacket>> + 'static {
        WatchStream::from_changes(self.frames.clone()).filter_map(|slot| async move { slot })
    }

    pub fn latest_frame(&self) -> Option<Arc<FramePacket>> {
        self.frames.borrow().clone()
    }

    /// Live timer tasks, per kind
    pub fn timer_census(&self) -> Arc<TimerCensus> {
        Arc::clone(&self.census)
    }

    /// Stop reconnecting, cancel all timers and close the socket.
    ///
    /// Idempotent; returns once the driver task has finished.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                debug!("Upstream driver task ended abnormally: {}", e);
            }
            info!("Upstream connection shut down");
        }
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        debug!("Dropping upstream connection");
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("phase", &self.phase())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
