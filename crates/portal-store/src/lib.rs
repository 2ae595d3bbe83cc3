//! Persistence layer for portald
//!
//! Provides:
//! - Users and their session fields
//! - Instance inventory
//! - The one-to-one user/instance assignment, written transactionally
//! - Audit log (append-only)

mod audit;
mod sqlite;
mod traits;

pub use audit::*;
pub use sqlite::*;
pub use traits::*;

use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Write would break the one-to-one assignment
    #[error("Assignment conflict: {0}")]
    Conflict(String),

    #[error("Owner {owner} already has {assigned} assigned users (limit {limit})")]
    OwnerLimit {
        owner: portal_util::UserId,
        assigned: u32,
        limit: u32,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for portal_util::PortalError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) | StoreError::Conflict(msg) => {
                portal_util::PortalError::validation(msg)
            }
            limit @ StoreError::OwnerLimit { .. } => {
                portal_util::PortalError::validation(limit.to_string())
            }
            other => portal_util::PortalError::store(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
