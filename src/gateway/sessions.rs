//! Registry of connected downstream sessions

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::trace;

pub type SessionId = u64;

/// Frames a session may have queued but not yet written.
///
/// With depth 1 a slow client skips frames instead of accumulating a backlog.
pub const SESSION_QUEUE_DEPTH: usize = 1;

/// Outcome of one [`SessionSet::broadcast`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Sessions whose queue was still full
    pub dropped: usize,
    /// Sessions found closed and removed
    pub pruned: usize,
}

/// Shared set of live sessions, each with a depth-1 outbound frame queue.
#[derive(Debug, Clone)]
pub struct SessionSet {
    sessions: Arc<RwLock<HashMap<SessionId, mpsc::Sender<Bytes>>>>,
    next_id: Arc<AtomicU64>,
    count: Arc<watch::Sender<usize>>,
}

impl Default for SessionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSet {
    pub fn new() -> Self {
        Self {
            sessions: Arc::default(),
            next_id: Arc::new(AtomicU64::new(1)),
            count: Arc::new(watch::channel(0).0),
        }
    }

    /// Add a session and return the receiving end of its frame queue.
    pub async fn register(&self) -> (SessionId, mpsc::Receiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);

        let mut sessions = self.sessions.write().await;
        sessions.insert(id, tx);
        self.count.send_replace(sessions.len());
        (id, rx)
    }

    pub async fn remove(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&id).is_some();
        self.count.send_replace(sessions.len());
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Offer `frame` to every session without waiting on any of them.
    pub async fn broadcast(&self, frame: Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();

        {
            let sessions = self.sessions.read().await;
            for (id, tx) in sessions.iter() {
                match tx.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        trace!(session = id, "Session queue full, dropping frame");
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &closed {
                sessions.remove(id);
            }
            self.count.send_replace(sessions.len());
            report.pruned = closed.len();
        }

        report
    }

    /// Resolves once no sessions remain.
    pub async fn drained(&self) {
        let mut count = self.count.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }
}
