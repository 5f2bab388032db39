//! Upstream target providers

mod file;
mod fixed;

pub use file::FileTarget;
pub use fixed::FixedTarget;
