//! IPC layer for portald
//!
//! Provides:
//! - Unix domain socket server
//! - NDJSON (newline-delimited JSON) protocol
//! - Client connection management
//! - Peer UID authentication (root and the service user administer)

mod client;
mod server;

pub use client::*;
pub use server::*;

use portal_api::ErrorCode;
use thiserror::Error;

/// IPC errors
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Server error: {0}")]
    ServerError(String),

    /// The service answered with an error
    #[error("{code:?}: {message}")]
    Remote { code: ErrorCode, message: String },
}

pub type IpcResult<T> = Result<T, IpcError>;
