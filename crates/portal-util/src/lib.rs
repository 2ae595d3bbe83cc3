//! Shared utilities for gpuportal
//!
//! This crate provides:
//! - ID types (UserId, InstanceId, ClientId)
//! - Time utilities (clock with mock support, wall-clock daily schedules)
//! - Error types
//! - Rate limiting helpers
//! - Default paths for socket, config, and data directories

mod error;
mod ids;
mod paths;
mod rate_limit;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use rate_limit::*;
pub use time::*;
