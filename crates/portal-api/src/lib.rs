//! Protocol types for portald IPC
//!
//! This crate defines the stable API between portald and its clients
//! (the HTTP gateway and admin tooling):
//! - Session and instance views
//! - Commands (requests from clients)
//! - Responses
//! - Events (service -> clients)
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
