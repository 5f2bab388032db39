//! Cancellable timers for the upstream driver.
//!
//! Each timer runs as a small task that posts [`TimerFired`] into the driver's
//! mailbox. The [`TimerSet`] keeps at most one handle per [`TimerKind`]:
//! arming a kind cancels the previous handle first, and every arm gets a new
//! generation so a tick that was already queued when its timer was cancelled
//! is recognised as stale and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// The timers owned by the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Periodic, while connected
    Heartbeat,
    /// Periodic, while connected
    HealthCheck,
    /// One-shot, while reconnecting
    Reconnect,
}

impl TimerKind {
    pub const ALL: [TimerKind; 3] =
        [TimerKind::Heartbeat, TimerKind::HealthCheck, TimerKind::Reconnect];

    pub fn is_periodic(self) -> bool {
        !matches!(self, TimerKind::Reconnect)
    }

    fn index(self) -> usize {
        match self {
            TimerKind::Heartbeat => 0,
            TimerKind::HealthCheck => 1,
            TimerKind::Reconnect => 2,
        }
    }
}

/// A timer expiry delivered to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Number of timer tasks currently alive, per kind.
#[derive(Debug, Default)]
pub struct TimerCensus {
    live: [AtomicUsize; 3],
}

impl TimerCensus {
    pub fn live(&self, kind: TimerKind) -> usize {
        self.live[kind.index()].load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        TimerKind::ALL.iter().map(|k| self.live(*k)).sum()
    }
}

struct LiveGuard {
    census: Arc<TimerCensus>,
    kind: TimerKind,
}

impl LiveGuard {
    fn enter(census: Arc<TimerCensus>, kind: TimerKind) -> Self {
        census.live[kind.index()].fetch_add(1, Ordering::AcqRel);
        Self { census, kind }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.census.live[self.kind.index()].fetch_sub(1, Ordering::AcqRel);
    }
}

struct TimerHandle {
    generation: u64,
    cancel: CancellationToken,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// At most one live timer per kind.
pub struct TimerSet {
    tx: mpsc::Sender<TimerFired>,
    slots: [Option<TimerHandle>; 3],
    next_generation: u64,
    census: Arc<TimerCensus>,
}

impl TimerSet {
    pub fn new(tx: mpsc::Sender<TimerFired>) -> Self {
        Self { tx, slots: [None, None, None], next_generation: 0, census: Arc::default() }
    }

    /// Shared view of live timer tasks
    pub fn census(&self) -> Arc<TimerCensus> {
        Arc::clone(&self.census)
    }

    /// Arm `kind` to fire after `period` (and every `period` after that if
    /// periodic), cancelling any live timer of the same kind first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&mut self, kind: TimerKind, period: Duration) -> u64 {
        self.cancel(kind);

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();

        let fired = TimerFired { kind, generation };
        let task_cancel = cancel.clone();
        let tx = self.tx.clone();
        let guard = LiveGuard::enter(Arc::clone(&self.census), kind);

        tokio::spawn(async move {
            let _guard = guard;
            if kind.is_periodic() {
                run_periodic(fired, period, tx, task_cancel).await;
            } else {
                run_once(fired, period, tx, task_cancel).await;
            }
        });

        trace!(?kind, generation, ?period, "Timer armed");
        self.slots[kind.index()] = Some(TimerHandle { generation, cancel });
        generation
    }

    /// Cancel the live timer of `kind`, if any.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.slots[kind.index()].take() {
            Some(handle) => {
                trace!(?kind, generation = handle.generation, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    /// Whether `fired` comes from the currently armed timer of its kind.
    ///
    /// A fired one-shot timer is disarmed on acceptance.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        let slot = &mut self.slots[fired.kind.index()];
        let current = slot.as_ref().is_some_and(|h| h.generation == fired.generation);

        if current && !fired.kind.is_periodic() {
            *slot = None;
        }
        if !current {
            trace!(kind = ?fired.kind, generation = fired.generation, "Dropping stale timer tick");
        }
        current
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_periodic(
    fired: TimerFired,
    period: Duration,
    tx: mpsc::Sender<TimerFired>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !deliver(fired, &tx, &cancel).await {
                    break;
                }
            }
        }
    }
}

async fn run_once(
    fired: TimerFired,
    delay: Duration,
    tx: mpsc::Sender<TimerFired>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {
            deliver(fired, &tx, &cancel).await;
        }
    }
}

async fn deliver(
    fired: TimerFired,
    tx: &mpsc::Sender<TimerFired>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(fired) => sent.is_ok(),
    }
}
