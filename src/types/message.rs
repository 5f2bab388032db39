//! The 40-byte controller message

use serde::{Deserialize, Serialize};

/// Size in bytes of one encoded [`Message`].
pub const FRAME_LEN: usize = 40;

/// Message type reserved for relay heartbeats.
pub const HEARTBEAT_TYPE: u8 = 100;

/// One wire-level message exchanged with the crane controller.
///
/// Values are carried as-is: the protocol defines no ranges and no checksum,
/// so nothing here is validated beyond the frame length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender identifier
    pub user_id: u8,

    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,

    /// Command/status discriminator
    pub kind: u8,

    /// Three signed 16-bit values
    pub values_i16: [i16; 3],

    /// Three 64-bit floats
    pub values_f64: [f64; 3],
}

impl Message {
    /// Create a new message
    pub fn new(
        user_id: u8,
        timestamp_ms: i64,
        kind: u8,
        values_i16: [i16; 3],
        values_f64: [f64; 3],
    ) -> Self {
        Self { user_id, timestamp_ms, kind, values_i16, values_f64 }
    }

    /// Heartbeat carrying `counter` in the first integer slot.
    pub fn heartbeat(user_id: u8, counter: i16, timestamp_ms: i64) -> Self {
        Self::new(user_id, timestamp_ms, HEARTBEAT_TYPE, [counter, 0, 0], [0.0; 3])
    }

    /// Whether this message is a relay heartbeat
    pub fn is_heartbeat(&self) -> bool {
        self.kind == HEARTBEAT_TYPE
    }

    /// Encode into the fixed 40-byte layout.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        crate::codec::encode(
            self.user_id,
            self.timestamp_ms,
            self.kind,
            self.values_i16,
            self.values_f64,
        )
    }

    /// Encode into a shareable buffer.
    pub fn to_bytes(&self) -> bytes::Bytes {
        bytes::Bytes::copy_from_slice(&self.encode())
    }
}
