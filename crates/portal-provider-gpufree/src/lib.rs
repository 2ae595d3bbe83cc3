//! GPUFree provider adapter for portald
//!
//! Provides:
//! - Instance lookup through the paged listing endpoint
//! - Start/stop through the webide action endpoint, skipped when the
//!   instance is already in the requested state
//! - Mapping of HTTP and API-level failures onto the provider error taxonomy

mod adapter;
mod wire;

pub use adapter::*;
pub use wire::*;
