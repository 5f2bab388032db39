//! Wire codec for the 40-byte controller message.
//!
//! # Layout
//!
//! Every multi-byte field is little-endian. Encoding is purely positional:
//!
//! | Offset | Size | Field        | Type      |
//! |--------|------|--------------|-----------|
//! | 0      | 1    | `user_id`    | `u8`      |
//! | 1      | 8    | `timestamp`  | `i64` ms  |
//! | 9      | 1    | `kind`       | `u8`      |
//! | 10     | 6    | `values_i16` | `[i16;3]` |
//! | 16     | 24   | `values_f64` | `[f64;3]` |
//!
//! There is no length prefix, checksum or sequence number. A buffer that is
//! long enough decodes successfully whatever its contents, so corrupt frames
//! that pass the length check are indistinguishable from real ones.
//!
//! ```rust
//! use crane_relay::codec;
//!
//! let bytes = codec::encode(1, 1_700_000_000_000, 5, [10, 20, 30], [1.5, 2.5, 3.5]);
//! let message = codec::decode(&bytes).unwrap();
//! assert_eq!(message.values_i16, [10, 20, 30]);
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{FRAME_LEN, Message};
use crate::{RelayError, Result};

const USER_ID_OFFSET: usize = 0;
const TIMESTAMP_OFFSET: usize = 1;
const KIND_OFFSET: usize = 9;
const VALUES_I16_OFFSET: usize = 10;
const VALUES_F64_OFFSET: usize = 16;

/// Length check applied before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameCheck {
    /// Accept any buffer of at least [`FRAME_LEN`] bytes; trailing bytes are ignored.
    #[default]
    Lenient,
    /// Accept only buffers of exactly [`FRAME_LEN`] bytes.
    Strict,
}

/// Encode the message fields into a 40-byte frame.
pub fn encode(
    user_id: u8,
    timestamp_ms: i64,
    kind: u8,
    values_i16: [i16; 3],
    values_f64: [f64; 3],
) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[USER_ID_OFFSET] = user_id;
    buf[TIMESTAMP_OFFSET..KIND_OFFSET].copy_from_slice(&timestamp_ms.to_le_bytes());
    buf[KIND_OFFSET] = kind;

    for (i, value) in values_i16.iter().enumerate() {
        let at = VALUES_I16_OFFSET + 2 * i;
        buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    for (i, value) in values_f64.iter().enumerate() {
        let at = VALUES_F64_OFFSET + 8 * i;
        buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    buf
}

/// Decode a message from the start of `bytes`.
///
/// Fails with [`RelayError::MalformedFrame`] when fewer than 40 bytes are
/// available. Field values are not validated.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    decode_with(bytes, FrameCheck::Lenient)
}

/// Decode with an explicit length check.
pub fn decode_with(bytes: &[u8], check: FrameCheck) -> Result<Message> {
    let acceptable = match check {
        FrameCheck::Lenient => bytes.len() >= FRAME_LEN,
        FrameCheck::Strict => bytes.len() == FRAME_LEN,
    };
    if !acceptable {
        return Err(RelayError::malformed_frame(FRAME_LEN, bytes.len()));
    }

    let frame: &[u8; FRAME_LEN] = bytes[..FRAME_LEN]
        .try_into()
        .map_err(|_| RelayError::malformed_frame(FRAME_LEN, bytes.len()))?;

    Ok(decode_frame(frame))
}

/// Decode the `index`-th 40-byte record of a buffer holding several
/// concatenated frames.
pub fn decode_at(bytes: &[u8], index: usize) -> Result<Message> {
    let start = index.saturating_mul(FRAME_LEN);
    let needed = start.saturating_add(FRAME_LEN);
    let record = bytes
        .get(start..needed)
        .ok_or_else(|| RelayError::malformed_frame(needed, bytes.len()))?;
    decode(record)
}

/// Iterate over every whole frame in `bytes`; a trailing partial frame is skipped.
pub fn frames(bytes: &[u8]) -> impl Iterator<Item = Message> + '_ {
    bytes.chunks_exact(FRAME_LEN).filter_map(|chunk| chunk.try_into().ok()).map(decode_frame)
}

fn decode_frame(frame: &[u8; FRAME_LEN]) -> Message {
    let i16_at = |at: usize| i16::from_le_bytes([frame[at], frame[at + 1]]);
    let f64_at = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&frame[at..at + 8]);
        f64::from_le_bytes(raw)
    };

    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&frame[TIMESTAMP_OFFSET..KIND_OFFSET]);

    Message {
        user_id: frame[USER_ID_OFFSET],
        timestamp_ms: i64::from_le_bytes(timestamp),
        kind: frame[KIND_OFFSET],
        values_i16: [
            i16_at(VALUES_I16_OFFSET),
            i16_at(VALUES_I16_OFFSET + 2),
            i16_at(VALUES_I16_OFFSET + 4),
        ],
        values_f64: [
            f64_at(VALUES_F64_OFFSET),
            f64_at(VALUES_F64_OFFSET + 8),
            f64_at(VALUES_F64_OFFSET + 16),
        ],
    }
}
