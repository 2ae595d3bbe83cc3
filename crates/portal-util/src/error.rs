//! Error types for gpuportal

use thiserror::Error;

use crate::{InstanceId, UserId};

/// Core error type for gpuportal operations
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("No instance assigned to user {0}")]
    NoInstanceAssigned(UserId),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Provider error: {message}")]
    ProviderError { transient: bool, message: String },

    #[error("Instance busy: {0}")]
    InstanceBusy(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PortalError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn provider(transient: bool, msg: impl Into<String>) -> Self {
        Self::ProviderError {
            transient,
            message: msg.into(),
        }
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::InstanceBusy(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreError(msg.into())
    }

    pub fn ipc(msg: impl Into<String>) -> Self {
        Self::IpcError(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for the rejected-synchronously class of errors (no state change happened)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UserNotFound(_)
                | Self::InstanceNotFound(_)
                | Self::NoInstanceAssigned(_)
                | Self::ValidationError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PortalError>;
