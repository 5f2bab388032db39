//! JSON events exchanged with WebSocket clients.
//!
//! Text frames carry `{"event": ..., "data": ...}` envelopes. Raw controller
//! frames travel as binary WebSocket messages in both directions.

use axum::extract::ws::Message as WsMessage;
use serde::{Deserialize, Serialize};

use crate::types::TcpStatus;

/// Events pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    TcpStatus(TcpStatus),
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error { message: message.into() }
    }

    /// Encode as a WebSocket text message
    pub fn to_message(&self) -> serde_json::Result<WsMessage> {
        serde_json::to_string(self).map(|text| WsMessage::Text(text.into()))
    }
}

/// Events accepted from clients as JSON text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Bytes to forward to the controller verbatim
    ClientMsg(Vec<u8>),
}
