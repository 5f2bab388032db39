//! Provider trait for upstream targets

use crate::Result;

/// Source of the upstream `host:port`.
///
/// The connection driver asks its provider for a target before every connect
/// attempt, so a provider backed by a config file picks up edits without a
/// restart.
#[async_trait::async_trait]
pub trait TargetProvider: Send + 'static {
    /// Resolve the address for the next connect attempt
    ///
    /// Returns a `host:port` string suitable for `tokio::net::lookup_host`.
    /// Providers should fall back to their last good target rather than fail
    /// on transient problems; an `Err` counts as a failed connect attempt.
    async fn next_target(&mut self) -> Result<String>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}
