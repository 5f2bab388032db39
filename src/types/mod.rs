//! Core types shared by the relay components.
//!
//! - [`Message`] is the fixed 40-byte controller message
//! - [`FramePacket`] is one raw inbound chunk, as held in the latest-frame slot
//! - [`TcpStatus`] is the connectivity event pushed to downstream sessions
//! - [`ConnectionPhase`] is the upstream lifecycle phase

mod frame;
mod message;
mod status;

pub use frame::FramePacket;
pub use message::{FRAME_LEN, HEARTBEAT_TYPE, Message};
pub use status::{ConnectionPhase, TcpStatus};
