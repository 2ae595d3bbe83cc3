//! Session lifecycle controller for portald
//!
//! This crate is the heart of portald, containing:
//! - Instance registry (exclusive user <-> instance assignment)
//! - Session state machine (Inactive -> Starting -> Active -> Stopping -> Inactive)
//! - Heartbeat tracking
//! - Inactivity reaper and stuck-`Stopping` reconciliation
//! - Daily shutdown scheduler

mod controller;
mod events;
mod reaper;
mod registry;
mod scheduler;
mod session;

pub use controller::*;
pub use events::*;
pub use reaper::*;
pub use registry::*;
pub use scheduler::*;
pub use session::*;
