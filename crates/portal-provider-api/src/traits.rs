//! Provider adapter traits

use async_trait::async_trait;
use portal_util::{InstanceId, PortalError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from provider operations
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The API answered but refused the request
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ProviderError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Whether the same call may succeed later.
    ///
    /// Exhausted retries count as permanent: the retry budget is spent, so
    /// callers act on the failure instead of retrying again.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Connect(_) => true,
            ProviderError::Http { status, .. } => *status >= 500 || *status == 429,
            ProviderError::RetriesExhausted { .. }
            | ProviderError::Rejected(_)
            | ProviderError::UnknownInstance(_)
            | ProviderError::MissingCredential(_)
            | ProviderError::InvalidResponse(_)
            | ProviderError::Internal(_) => false,
        }
    }
}

impl From<ProviderError> for PortalError {
    fn from(e: ProviderError) -> Self {
        PortalError::provider(e.is_transient(), e.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Provider-side identity of an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub uuid: InstanceId,
    /// Numeric id assigned by the provider
    pub provider_id: u64,
}

impl InstanceRef {
    pub fn new(uuid: impl Into<InstanceId>, provider_id: u64) -> Self {
        Self {
            uuid: uuid.into(),
            provider_id,
        }
    }
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.uuid, self.provider_id)
    }
}

/// What the provider reports about an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub running: bool,
    /// Raw provider status code, if it has one
    pub status_code: Option<u8>,
    /// URL the provider exposes for the running instance
    pub url: Option<String>,
}

impl InstanceStatus {
    pub fn running(url: Option<String>) -> Self {
        Self {
            running: true,
            status_code: None,
            url,
        }
    }

    pub fn stopped() -> Self {
        Self {
            running: false,
            status_code: None,
            url: None,
        }
    }
}

/// Result of a start or stop call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAction {
    /// The action was sent to the provider
    Issued,
    /// The instance was already in the requested state
    Skipped,
}

/// Provider adapter trait - implemented by provisioning backends
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short backend name for logs and health output
    fn name(&self) -> &str;

    /// Ask the provider to start an instance. Does not wait for boot.
    async fn start(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction>;

    /// Ask the provider to stop an instance
    async fn stop(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction>;

    /// Current provider-side status of an instance
    async fn query(&self, instance: &InstanceRef) -> ProviderResult<InstanceStatus>;

    /// Optional: check if the provider is reachable and configured
    fn is_healthy(&self) -> bool {
        true
    }
}

#[async_trait]
impl<P: ProviderAdapter + ?Sized> ProviderAdapter for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn start(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction> {
        (**self).start(instance).await
    }

    async fn stop(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction> {
        (**self).stop(instance).await
    }

    async fn query(&self, instance: &InstanceRef) -> ProviderResult<InstanceStatus> {
        (**self).query(instance).await
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProviderError::Connect("refused".into()).is_transient());
        assert!(ProviderError::Http { status: 502, message: String::new() }.is_transient());
        assert!(ProviderError::Http { status: 429, message: String::new() }.is_transient());

        assert!(!ProviderError::Http { status: 401, message: String::new() }.is_transient());
        assert!(!ProviderError::Rejected("bad token".into()).is_transient());
        assert!(!ProviderError::UnknownInstance(InstanceId::new("x")).is_transient());
        assert!(!ProviderError::MissingCredential("GPUFREE_BEARER_TOKEN".into()).is_transient());
    }

    #[test]
    fn exhausted_retries_are_permanent() {
        let err = ProviderError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ProviderError::Timeout(Duration::from_secs(15))),
        };
        assert!(!err.is_transient());

        let portal: PortalError = err.into();
        assert!(matches!(portal, PortalError::ProviderError { transient: false, .. }));
    }

    #[test]
    fn instance_status_serialization() {
        let status = InstanceStatus::running(Some("https://lab.example.com".into()));
        let json = serde_json::to_string(&status).unwrap();
        let parsed: InstanceStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
