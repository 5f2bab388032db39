//! Relay configuration.
//!
//! Configuration is read from a YAML file, then overridden by the `TCP_HOST`
//! and `TCP_PORT` environment variables. A missing file is not an error: the
//! defaults point at `localhost:9999` like the controller's factory setup.
//!
//! ```yaml
//! upstream:
//!   tcp_server_host: 192.168.1.20
//!   tcp_server_port: 9999
//! gateway:
//!   bind: 0.0.0.0:9999
//! timing:
//!   reconnect_delay_ms: 3000
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::codec::FrameCheck;
use crate::{RelayError, Result};

/// Environment variable overriding the upstream host.
pub const ENV_TCP_HOST: &str = "TCP_HOST";
/// Environment variable overriding the upstream port.
pub const ENV_TCP_PORT: &str = "TCP_PORT";

/// Top-level relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub upstream: UpstreamConfig,
    pub gateway: GatewayConfig,
    pub timing: TimingConfig,
}

/// Where the crane controller listens, and how to talk to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(rename = "tcp_server_host")]
    pub host: String,
    #[serde(rename = "tcp_server_port")]
    pub port: u16,
    /// `user_id` stamped on heartbeat messages
    pub heartbeat_user_id: u8,
    /// Length check used when decoding inbound frames
    pub frame_check: FrameCheck,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9999,
            heartbeat_user_id: 0,
            frame_check: FrameCheck::Lenient,
        }
    }
}

impl UpstreamConfig {
    /// `host:port` as passed to address resolution
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Downstream WebSocket listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Interval between WebSocket pings to idle sessions
    pub ping_interval_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { bind: SocketAddr::from(([0, 0, 0, 0], 9999)), ping_interval_ms: 15_000 }
    }
}

impl GatewayConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Timer periods and thresholds, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub stall_threshold_ms: u64,
    /// Fixed delay before every reconnect attempt; no backoff
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub broadcast_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_500,
            health_check_interval_ms: 30_000,
            stall_threshold_ms: 120_000,
            reconnect_delay_ms: 3_000,
            connect_timeout_ms: 10_000,
            broadcast_interval_ms: 33,
            shutdown_timeout_ms: 3_000,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl RelayConfig {
    /// Parse configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml)
            .map_err(|e| RelayError::config(format!("invalid YAML configuration: {e}")))
    }

    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist. Environment overrides are applied and the result validated.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read the file without env overrides or validation.
    pub fn read_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::io(format!("reading {}", path.display()), e))?;
        let config = Self::from_yaml(&text)?;
        info!(path = %path.display(), target = %config.upstream.target(), "Loaded config file");
        Ok(config)
    }

    /// Apply `TCP_HOST` / `TCP_PORT` overrides using the given lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_TCP_HOST).filter(|h| !h.trim().is_empty()) {
            self.upstream.host = host.trim().to_string();
        }

        if let Some(port) = lookup(ENV_TCP_PORT) {
            self.upstream.port = port.trim().parse().map_err(|_| {
                RelayError::config(format!("{ENV_TCP_PORT} is not a valid port: {port:?}"))
            })?;
        }

        Ok(())
    }

    /// Reject values that would make timers spin or sockets unusable.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.host.trim().is_empty() {
            return Err(RelayError::config("tcp_server_host must not be empty"));
        }
        if self.upstream.port == 0 {
            return Err(RelayError::config("tcp_server_port must not be 0"));
        }

        let timing = &self.timing;
        let intervals = [
            ("heartbeat_interval_ms", timing.heartbeat_interval_ms),
            ("health_check_interval_ms", timing.health_check_interval_ms),
            ("stall_threshold_ms", timing.stall_threshold_ms),
            ("reconnect_delay_ms", timing.reconnect_delay_ms),
            ("connect_timeout_ms", timing.connect_timeout_ms),
            ("broadcast_interval_ms", timing.broadcast_interval_ms),
            ("shutdown_timeout_ms", timing.shutdown_timeout_ms),
            ("ping_interval_ms", self.gateway.ping_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(RelayError::config(format!("{name} must be greater than 0")));
            }
        }

        Ok(())
    }
}
