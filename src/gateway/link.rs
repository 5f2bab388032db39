//! The gateway's view of the upstream connection

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::Result;
use crate::connection::UpstreamConnection;
use crate::types::TcpStatus;

/// What a downstream session may do with the upstream.
#[async_trait::async_trait]
pub trait UpstreamLink: Send + Sync + 'static {
    /// Status snapshot sent to new sessions
    fn status(&self) -> TcpStatus;

    /// Contents of the latest-frame slot, offered once to a new session
    fn current_frame(&self) -> Option<Bytes>;

    /// Every status transition from now on, in order
    fn status_events(&self) -> broadcast::Receiver<TcpStatus>;

    /// Forward a client message; errors when not connected
    async fn send(&self, payload: Bytes) -> Result<()>;
}

#[async_trait::async_trait]
impl UpstreamLink for UpstreamConnection {
    fn status(&self) -> TcpStatus {
        UpstreamConnection::status(self)
    }

    fn current_frame(&self) -> Option<Bytes> {
        UpstreamConnection::latest_frame(self).map(|packet| packet.data.clone())
    }

    fn status_events(&self) -> broadcast::Receiver<TcpStatus> {
        UpstreamConnection::status_events(self)
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        UpstreamConnection::send(self, payload).await
    }
}
