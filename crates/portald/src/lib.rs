//! portald - GPU instance session lifecycle service
//!
//! Wires together:
//! - Configuration loading and seeding of users and instances
//! - SQLite store
//! - Provider adapter (GPUFree behind timeout and retry, or the mock)
//! - Session controller, inactivity reaper and daily shutdown scheduler
//! - IPC server

mod dispatch;
mod seed;
mod service;

pub use dispatch::*;
pub use seed::*;
pub use service::*;
