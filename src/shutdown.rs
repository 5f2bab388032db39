//! Ordered, single-shot process shutdown.
//!
//! The first signal runs every [`ShutdownStage`] in registration order under
//! a hard timeout. A second signal while that is in progress exits at once
//! with status 1 and never re-runs a stage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connection::UpstreamConnection;
use crate::gateway::Gateway;
use crate::{RelayError, Result};

/// One step of teardown.
#[async_trait::async_trait]
pub trait ShutdownStage: Send + Sync {
    fn name(&self) -> &str;

    async fn shutdown(&self);
}

#[async_trait::async_trait]
impl ShutdownStage for UpstreamConnection {
    fn name(&self) -> &str {
        "upstream"
    }

    async fn shutdown(&self) {
        UpstreamConnection::shutdown(self).await;
    }
}

#[async_trait::async_trait]
impl ShutdownStage for Gateway {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}

/// Cancels a token, e.g. the one a listener serves until.
#[derive(Debug, Clone)]
pub struct CancelStage {
    name: String,
    token: CancellationToken,
}

impl CancelStage {
    pub fn new(name: impl Into<String>, token: CancellationToken) -> Self {
        Self { name: name.into(), token }
    }
}

#[async_trait::async_trait]
impl ShutdownStage for CancelStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) {
        self.token.cancel();
    }
}

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every stage finished in time
    Graceful,
    /// The hard timeout expired; exit status 0
    TimedOut,
    /// A second signal arrived during teardown; exit status 1
    Forced,
}

pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

pub struct ShutdownCoordinator {
    stages: Vec<Arc<dyn ShutdownStage>>,
    timeout: Duration,
    exit: ExitHook,
    started: AtomicBool,
    teardowns: AtomicUsize,
    outcome: watch::Sender<Option<ShutdownOutcome>>,
}

impl ShutdownCoordinator {
    /// Coordinator that calls `std::process::exit` on timeout or a second signal.
    pub fn new(timeout: Duration) -> Self {
        Self {
            stages: Vec::new(),
            timeout,
            exit: Arc::new(|code| std::process::exit(code)),
            started: AtomicBool::new(false),
            teardowns: AtomicUsize::new(0),
            outcome: watch::channel(None).0,
        }
    }

    /// Replace the process exit, for tests.
    pub fn with_exit_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit = Arc::new(hook);
        self
    }

    /// Append a stage; stages run in the order added.
    pub fn stage(mut self, stage: Arc<dyn ShutdownStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of times teardown has started; never more than one
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::Acquire)
    }

    /// Handle one shutdown signal.
    pub async fn trigger(&self) -> ShutdownOutcome {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("{}, forcing exit", RelayError::ShutdownRace);
            return self.finish(ShutdownOutcome::Forced);
        }

        self.teardowns.fetch_add(1, Ordering::AcqRel);
        info!(stages = self.stages.len(), timeout = ?self.timeout, "Shutting down");

        match tokio::time::timeout(self.timeout, self.run_stages()).await {
            Ok(()) => {
                info!("Shutdown complete");
                self.finish(ShutdownOutcome::Graceful)
            }
            Err(_) => {
                error!("{}, forcing exit", RelayError::Timeout { duration: self.timeout });
                self.finish(ShutdownOutcome::TimedOut)
            }
        }
    }

    async fn run_stages(&self) {
        for stage in &self.stages {
            info!(stage = stage.name(), "Stopping");
            stage.shutdown().await;
        }
    }

    fn finish(&self, outcome: ShutdownOutcome) -> ShutdownOutcome {
        // The first outcome recorded is the one waiters see
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });

        match outcome {
            ShutdownOutcome::Graceful => {}
            ShutdownOutcome::TimedOut => (self.exit)(0),
            ShutdownOutcome::Forced => (self.exit)(1),
        }
        outcome
    }

    /// Resolves with the outcome once a shutdown has ended.
    pub async fn wait(&self) -> ShutdownOutcome {
        let mut outcome = self.outcome.subscribe();
        loop {
            if let Some(done) = *outcome.borrow_and_update() {
                return done;
            }
            if outcome.changed().await.is_err() {
                return ShutdownOutcome::Forced;
            }
        }
    }

    /// Trigger on every SIGINT, and SIGTERM on unix, until the process ends.
    pub fn listen_for_signals(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            loop {
                wait_for_signal().await?;
                let coordinator = Arc::clone(&self);
                tokio::spawn(async move { coordinator.trigger().await });
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| RelayError::io("installing SIGTERM handler", e))?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| RelayError::io("waiting for Ctrl-C", e))?;
            info!("Received SIGINT");
        }
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.map_err(|e| RelayError::io("waiting for Ctrl-C", e))?;
    info!("Received Ctrl-C");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ShutdownStage for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn shutdown(&self) {
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(self.name);
        }
    }

    fn recording(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        delay: Duration,
    ) -> Arc<dyn ShutdownStage> {
        Arc::new(Recording { name, log: Arc::clone(log), delay })
    }

    fn exit_recorder() -> (Arc<Mutex<Vec<i32>>>, impl Fn(i32) + Send + Sync + 'static) {
        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&codes);
        (codes, move |code| sink.lock().unwrap().push(code))
    }

    #[tokio::test(start_paused = true)]
    async fn stages_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (codes, hook) = exit_recorder();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(3))
            .with_exit_hook(hook)
            .stage(recording("upstream", &log, Duration::from_millis(20)))
            .stage(recording("gateway", &log, Duration::ZERO))
            .stage(recording("listener", &log, Duration::from_millis(5)));

        assert_eq!(coordinator.trigger().await, ShutdownOutcome::Graceful);
        assert_eq!(*log.lock().unwrap(), vec!["upstream", "gateway", "listener"]);
        assert!(codes.lock().unwrap().is_empty());
        assert_eq!(coordinator.wait().await, ShutdownOutcome::Graceful);
    }

    #[tokio::test(start_paused = true)]
    async fn second_signal_forces_exit_without_second_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (codes, hook) = exit_recorder();
        let coordinator = Arc::new(
            ShutdownCoordinator::new(Duration::from_secs(3))
                .with_exit_hook(hook)
                .stage(recording("upstream", &log, Duration::from_millis(100))),
        );

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.trigger().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(coordinator.trigger().await, ShutdownOutcome::Forced);
        assert_eq!(*codes.lock().unwrap(), vec![1]);
        assert_eq!(coordinator.wait().await, ShutdownOutcome::Forced);

        first.await.unwrap();
        assert_eq!(coordinator.teardown_count(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_stage_hits_the_hard_timeout() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (codes, hook) = exit_recorder();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(3))
            .with_exit_hook(hook)
            .stage(recording("stuck", &log, Duration::from_secs(3600)))
            .stage(recording("never", &log, Duration::ZERO));

        assert_eq!(coordinator.trigger().await, ShutdownOutcome::TimedOut);
        assert_eq!(*codes.lock().unwrap(), vec![0]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_stage_cancels_its_token() {
        let token = CancellationToken::new();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1))
            .stage(Arc::new(CancelStage::new("listener", token.clone())));

        coordinator.trigger().await;
        assert!(token.is_cancelled());
        assert!(coordinator.is_shutting_down());
    }
}
