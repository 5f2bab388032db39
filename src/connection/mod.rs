//! Upstream controller connection.
//!
//! [`UpstreamConnection`] is the handle; the socket itself lives in the
//! driver task, steered by the pure [`ConnectionState`] machine and a
//! [`TimerSet`] that never holds more than one timer per kind.

pub mod state;
pub mod timers;
pub mod upstream;


pub use state::{ConnectionState, Effect, Event, SocketProbe};
pub use timers::{TimerCensus, TimerFired, TimerKind, TimerSet};
pub use upstream::UpstreamConnection;
