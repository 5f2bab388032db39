//! Error types for the relay.
//!
//! All errors implement `std::error::Error` and carry enough context to tell a
//! connection-level failure (recovered by the reconnect loop) from a local one
//! (a bad frame, a write attempted while the upstream is down).
//!
//! ## Error Categories
//!
//! - **Connection Errors**: connect failures and data stalls on the upstream socket
//! - **Frame Errors**: buffers too short to hold a 40-byte message
//! - **Session Errors**: client writes attempted while the upstream is disconnected or backed up
//! - **Lifecycle Errors**: shutdown races and closed internal channels
//! - **Configuration Errors**: unreadable or invalid configuration
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use crane_relay::RelayError;
//!
//! let error = RelayError::connect_failure("10.0.0.7:9999");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Main error type for relay operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    #[error("Failed to connect to upstream {target}")]
    ConnectFailure {
        target: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No upstream data for {silent_for:?} and the socket is dead")]
    DataStall { silent_for: Duration },

    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    #[error("TCP server not connected")]
    WriteWhileDisconnected,

    #[error("Upstream write queue full ({depth} writes pending)")]
    WriteBacklog { depth: usize },

    #[error("Shutdown already in progress")]
    ShutdownRace,

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("I/O error while {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Gateway error: {reason}")]
    Gateway { reason: String },

    #[error("Internal channel closed: {channel}")]
    ChannelClosed { channel: &'static str },
}

impl RelayError {
    /// Returns whether this error is recovered by retrying the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::ConnectFailure { .. } => true,
            RelayError::DataStall { .. } => true,
            RelayError::Timeout { .. } => true,
            RelayError::WriteWhileDisconnected => true,
            RelayError::WriteBacklog { .. } => true,
            RelayError::Io { .. } => true,
            RelayError::MalformedFrame { .. } => false,
            RelayError::ShutdownRace => false,
            RelayError::Config { .. } => false,
            RelayError::Gateway { .. } => false,
            RelayError::ChannelClosed { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            RelayError::ConnectFailure { .. } => vec![
                "Check that the crane controller is powered and listening",
                "Verify tcp_server_host and tcp_server_port in the config",
                "Check firewall rules between relay and controller",
            ],
            RelayError::DataStall { .. } => vec![
                "Check the network path to the controller",
                "Verify the controller is still publishing telemetry",
            ],
            RelayError::MalformedFrame { .. } => vec![
                "Verify the controller speaks the 40-byte message format",
                "Check for truncated writes on the upstream side",
            ],
            RelayError::WriteWhileDisconnected => vec![
                "Wait for a tcp-status event with connected=true",
                "Retry the command after the relay reconnects",
            ],
            RelayError::WriteBacklog { .. } => vec![
                "Check that the controller is reading from its socket",
                "Reduce the rate of client commands",
            ],
            RelayError::ShutdownRace => vec!["Wait for the first shutdown to finish"],
            RelayError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Check TCP_HOST and TCP_PORT environment overrides",
            ],
            RelayError::Io { .. } => vec![
                "Check that the bind address is free",
                "Check file permissions on the config path",
            ],
            RelayError::Timeout { .. } => vec![
                "Increase the configured timeout",
                "Check that the controller answers connection attempts",
            ],
            RelayError::Gateway { .. } => vec!["Restart the relay process"],
            RelayError::ChannelClosed { .. } => vec!["Restart the relay process"],
        }
    }

    /// Helper constructor for connect failures.
    pub fn connect_failure(target: impl Into<String>) -> Self {
        RelayError::ConnectFailure { target: target.into(), source: None }
    }

    /// Helper constructor for connect failures with source.
    pub fn connect_failure_with_source(
        target: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        RelayError::ConnectFailure { target: target.into(), source: Some(source) }
    }

    /// Helper constructor for short frames.
    pub fn malformed_frame(expected: usize, actual: usize) -> Self {
        RelayError::MalformedFrame { expected, actual }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        RelayError::Config { reason: reason.into() }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        RelayError::Io { context: context.into(), source }
    }

    /// Helper constructor for gateway errors.
    pub fn gateway(reason: impl Into<String>) -> Self {
        RelayError::Gateway { reason: reason.into() }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io { context: "unknown operation".to_string(), source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            target in "[a-z0-9.]{1,20}:[0-9]{1,5}",
            expected in 1usize..128,
            actual in 0usize..128,
            reason in ".*",
          ) {
            let connect = RelayError::connect_failure(target.clone());
            prop_assert!(connect.to_string().contains(&target));

            let frame = RelayError::malformed_frame(expected, actual);
            let msg = frame.to_string();
            prop_assert!(msg.contains(&expected.to_string()));
            prop_assert!(msg.contains(&actual.to_string()));

            let config = RelayError::config(reason.clone());
            prop_assert!(config.to_string().contains(&reason));
          }

          #[test]
          fn io_conversion_preserves_message(reason in ".*") {
            let io_err = std::io::Error::other(reason.clone());
            let converted: RelayError = io_err.into();
            match converted {
              RelayError::Io { source, .. } => prop_assert_eq!(source.to_string(), reason),
              _ => prop_assert!(false, "Expected Io error from io::Error conversion"),
            }
          }
        }
    }

    #[test]
    fn write_while_disconnected_matches_client_wording() {
        assert_eq!(RelayError::WriteWhileDisconnected.to_string(), "TCP server not connected");
    }

    #[test]
    fn connection_level_errors_are_retryable() {
        assert!(RelayError::connect_failure("x:1").is_retryable());
        assert!(RelayError::DataStall { silent_for: Duration::from_secs(121) }.is_retryable());
        assert!(!RelayError::malformed_frame(40, 3).is_retryable());
        assert!(!RelayError::ShutdownRace.is_retryable());
    }

    #[test]
    fn every_error_has_suggestions() {
        let errors = [
            RelayError::connect_failure("x:1"),
            RelayError::DataStall { silent_for: Duration::from_secs(1) },
            RelayError::malformed_frame(40, 0),
            RelayError::WriteWhileDisconnected,
            RelayError::WriteBacklog { depth: 64 },
            RelayError::ShutdownRace,
            RelayError::config("bad"),
            RelayError::io("binding", std::io::Error::other("busy")),
            RelayError::Timeout { duration: Duration::from_secs(3) },
            RelayError::gateway("closed"),
            RelayError::ChannelClosed { channel: "commands" },
        ];

        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "{error} has no suggestions");
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn source_chain_is_preserved() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = RelayError::connect_failure_with_source("plc:9999", Box::new(inner));
        let source = std::error::Error::source(&error).expect("source should be attached");
        assert_eq!(source.to_string(), "refused");
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<RelayError>();
    }
}
