//! Frame packet held in the latest-frame slot

use bytes::Bytes;
use std::time::SystemTime;

use super::Message;

/// One inbound chunk from the upstream socket.
///
/// The payload is shared by every session it is broadcast to (zero-copy via
/// `Bytes`). Chunks are not reassembled: each read is treated as a complete
/// snapshot.
#[derive(Debug, Clone)]
pub struct FramePacket {
    /// Raw bytes exactly as read from the socket
    pub data: Bytes,

    /// Wall-clock capture time
    pub received_at: SystemTime,

    /// Increases by one for every chunk read, across reconnects
    pub sequence: u64,
}

impl FramePacket {
    /// Create a new frame packet
    pub fn new(data: impl Into<Bytes>, sequence: u64) -> Self {
        Self { data: data.into(), received_at: SystemTime::now(), sequence }
    }

    /// Decode the first message of the payload.
    pub fn message(&self) -> crate::Result<Message> {
        crate::codec::decode(&self.data)
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
