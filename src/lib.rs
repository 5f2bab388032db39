//! Telemetry relay between a crane controller and WebSocket clients.
//!
//! One TCP connection to the controller is kept alive with heartbeats, a
//! stall check and a fixed-delay reconnect. Whatever the controller sends is
//! kept as the latest frame and fanned out to every WebSocket session on a
//! fixed tick; slow sessions skip frames instead of queueing them. Messages
//! from sessions are written back to the controller verbatim.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use crane_relay::{CraneRelay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> crane_relay::Result<()> {
//!     let config = RelayConfig::default();
//!     let relay = CraneRelay::connect(&config);
//!     let listener = crane_relay::gateway::Gateway::bind(&config.gateway).await?;
//!     relay.serve(listener).await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub(crate) mod driver;
mod error;
pub mod gateway;
pub mod provider;
pub mod providers;
pub mod relay;
pub mod shutdown;
pub mod stream;
pub mod types;

#[doc = include_str!("../README.md")]
#[cfg(doctest)]
pub struct ReadmeDoctests;

#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

pub use codec::FrameCheck;
pub use config::RelayConfig;
pub use connection::UpstreamConnection;
pub use error::*;
pub use gateway::{Gateway, UpstreamLink};
pub use relay::{LatestFrameRelay, RelayStats};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownStage};
pub use types::*;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::provider::TargetProvider;
use crate::providers::FixedTarget;
use crate::shutdown::CancelStage;

/// A running relay: upstream connection, frame relay and gateway.
///
/// Dropping it stops the upstream driver and the relay task; prefer
/// [`shutdown_coordinator`](Self::shutdown_coordinator) for an ordered stop.
pub struct CraneRelay {
    upstream: Arc<UpstreamConnection>,
    gateway: Gateway,
    relay: LatestFrameRelay,
    relay_stop: CancellationToken,
    listener_stop: CancellationToken,
    config: RelayConfig,
}

impl CraneRelay {
    /// Start the relay against the target named in `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: &RelayConfig) -> Self {
        Self::start(config, FixedTarget::new(config.upstream.target()))
    }

    /// Start the relay with a custom target provider.
    pub fn start<P>(config: &RelayConfig, provider: P) -> Self
    where
        P: TargetProvider,
    {
        let upstream =
            Arc::new(UpstreamConnection::spawn(provider, config.upstream.clone(), config.timing));
        let gateway = Gateway::new(upstream.clone(), &config.gateway);

        let relay_stop = CancellationToken::new();
        let relay = LatestFrameRelay::spawn(
            upstream.frames(),
            gateway.sessions(),
            config.timing.broadcast_interval(),
            relay_stop.clone(),
        );

        Self {
            upstream,
            gateway,
            relay,
            relay_stop,
            listener_stop: CancellationToken::new(),
            config: config.clone(),
        }
    }

    pub fn upstream(&self) -> &Arc<UpstreamConnection> {
        &self.upstream
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn relay_stats(&self) -> Arc<RelayStats> {
        self.relay.stats()
    }

    /// Serve WebSocket sessions on `listener` until the listener stage runs.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.gateway.serve(listener, self.listener_stop.clone()).await
    }

    /// Coordinator that tears down, in order, the upstream, the gateway, the
    /// frame relay and the listener.
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(self.config.timing.shutdown_timeout())
            .stage(self.upstream.clone())
            .stage(Arc::new(self.gateway.clone()))
            .stage(Arc::new(CancelStage::new("relay", self.relay_stop.clone())))
            .stage(Arc::new(CancelStage::new("listener", self.listener_stop.clone())))
    }
}

impl Drop for CraneRelay {
    fn drop(&mut self) {
        self.relay_stop.cancel();
        self.listener_stop.cancel();
    }
}
