//! Provider adapter interface for portald
//!
//! This crate defines the boundary between the session controller and the
//! external instance-provisioning API. It contains no HTTP code itself.
//!
//! - [`ProviderAdapter`]: start, stop and query an instance
//! - [`ProviderError`]: failure taxonomy, split into transient and permanent
//! - [`RetryingProvider`]: per-call timeout plus bounded retry with backoff
//! - [`MockProvider`]: scripted in-memory provider for tests and development

mod mock;
mod retry;
mod traits;

pub use mock::*;
pub use retry::*;
pub use traits::*;
