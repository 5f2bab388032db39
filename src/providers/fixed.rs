//! Fixed upstream target

use crate::Result;
use crate::provider::TargetProvider;

/// Always connects to the same address
#[derive(Debug, Clone)]
pub struct FixedTarget {
    target: String,
}

impl FixedTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into() }
    }
}

#[async_trait::async_trait]
impl TargetProvider for FixedTarget {
    async fn next_target(&mut self) -> Result<String> {
        Ok(self.target.clone())
    }

    fn describe(&self) -> String {
        format!("fixed {}", self.target)
    }
}
