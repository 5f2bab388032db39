//! Latest-frame relay.
//!
//! Samples the upstream's latest-frame slot on a fixed tick and offers the
//! frame to every session. Frames that are replaced before a tick are never
//! sent, and a frame already broadcast is not sent again.

use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::gateway::{BroadcastReport, SessionSet};
use crate::stream::ThrottleExt;
use crate::types::FramePacket;

/// Running totals for the relay
#[derive(Debug, Default)]
pub struct RelayStats {
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RelayStats {
    /// Ticks that offered a frame to at least one session
    pub fn broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    /// Frames queued to a session
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames skipped because a session's queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record(&self, report: BroadcastReport) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
    }
}

/// Handle to a running relay task
pub struct LatestFrameRelay {
    stats: Arc<RelayStats>,
    task: JoinHandle<()>,
}

impl LatestFrameRelay {
    /// Start relaying `frames` to `sessions` every `interval` until `cancel`.
    pub fn spawn(
        frames: watch::Receiver<Option<Arc<FramePacket>>>,
        sessions: SessionSet,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(RelayStats::default());

        let updates = WatchStream::from_changes(frames)
            .filter_map(|slot| async move { slot })
            .throttle(interval)
            .boxed();

        let task = tokio::spawn(run(updates, sessions, Arc::clone(&stats), cancel));
        info!(interval = ?interval, "Latest-frame relay started");

        Self { stats, task }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for the relay task to end after cancellation.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            debug!("Relay task ended abnormally: {}", e);
        }
    }
}

async fn run(
    mut updates: futures::stream::BoxStream<'static, Arc<FramePacket>>,
    sessions: SessionSet,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = updates.next() => match next {
                Some(packet) => {
                    if sessions.is_empty().await {
                        continue;
                    }
                    let report = sessions.broadcast(packet.data.clone()).await;
                    trace!(
                        sequence = packet.sequence,
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "Broadcast frame"
                    );
                    stats.record(report);
                }
                None => {
                    debug!("Frame source closed");
                    break;
                }
            },
        }
    }

    info!(
        broadcasts = stats.broadcasts(),
        delivered = stats.delivered(),
        dropped = stats.dropped(),
        "Latest-frame relay stopped"
    );
}
