//! Connectivity status and connection phase

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream connectivity as seen by downstream sessions.
///
/// Serializes to `{"connected": bool, "error"?: string}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TcpStatus {
    pub fn connected() -> Self {
        Self { connected: true, error: None }
    }

    pub fn disconnected(error: Option<String>) -> Self {
        Self { connected: false, error }
    }
}

/// Lifecycle phase of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal
    ShuttingDown,
}

impl ConnectionPhase {
    /// Writes are only accepted in this phase.
    pub fn is_writable(self) -> bool {
        matches!(self, ConnectionPhase::Connected)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Reconnecting => "reconnecting",
            ConnectionPhase::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}
