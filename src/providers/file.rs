//! Upstream target re-read from the config file

use std::path::PathBuf;
use tracing::{debug, warn};

use crate::Result;
use crate::config::{RelayConfig, UpstreamConfig};
use crate::provider::TargetProvider;

/// Re-reads the configuration file before every connect attempt.
///
/// Operators retarget the relay by editing the file; the next reconnect uses
/// the new address. When the file is unreadable or invalid the last good
/// target is kept.
#[derive(Debug, Clone)]
pub struct FileTarget {
    path: PathBuf,
    last_good: UpstreamConfig,
}

impl FileTarget {
    /// Create a provider for `path`, starting from `initial`.
    pub fn new(path: impl Into<PathBuf>, initial: UpstreamConfig) -> Self {
        Self { path: path.into(), last_good: initial }
    }

    fn reload(&self) -> Result<UpstreamConfig> {
        let mut config = RelayConfig::read_file(&self.path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config.upstream)
    }
}

#[async_trait::async_trait]
impl TargetProvider for FileTarget {
    async fn next_target(&mut self) -> Result<String> {
        match self.reload() {
            Ok(upstream) => {
                if upstream.target() != self.last_good.target() {
                    debug!(
                        from = %self.last_good.target(),
                        to = %upstream.target(),
                        "Upstream target changed"
                    );
                }
                self.last_good = upstream;
            }
            Err(e) => {
                warn!(
                    "Failed to reload {}: {}, keeping {}",
                    self.path.display(),
                    e,
                    self.last_good.target()
                );
            }
        }

        Ok(self.last_good.target())
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}
