//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Paths used by the service
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Session controller, reaper and reconcile settings
    #[serde(default)]
    pub controller: RawControllerConfig,

    /// Daily shutdown schedule
    #[serde(default)]
    pub shutdown: RawShutdownConfig,

    #[serde(default)]
    pub provider: RawProviderConfig,

    /// Users seeded into the store at startup
    #[serde(default)]
    pub users: Vec<RawUser>,

    /// Instances seeded into the store at startup
    #[serde(default)]
    pub instances: Vec<RawInstance>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path (default: $XDG_RUNTIME_DIR/gpuportal/portald.sock)
    pub socket_path: Option<PathBuf>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawControllerConfig {
    /// Minutes without a heartbeat before an active session is stopped
    pub inactivity_timeout_minutes: Option<u64>,

    /// How often the reaper sweeps
    pub reaper_interval_seconds: Option<u64>,

    /// Concurrent provider stops per sweep
    pub sweep_concurrency: Option<usize>,

    /// Provider stop attempts before a session is force-finalised
    pub stop_attempts: Option<u32>,

    /// Seconds between those attempts; 0 retries immediately
    pub stop_retry_delay_seconds: Option<u64>,

    /// How long a session may sit in Stopping before it is reconciled
    pub stuck_stopping_grace_seconds: Option<u64>,

    /// Assigned users per owning admin; 0 means unlimited
    pub max_assignments_per_owner: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawShutdownConfig {
    pub enabled: Option<bool>,

    /// Wall-clock time (HH:MM format)
    pub at: Option<String>,

    /// Fixed UTC offset of the wall clock (+HH:MM format)
    pub utc_offset: Option<String>,
}

/// Which provider backend to talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawProviderKind {
    #[default]
    Gpufree,
    Mock,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawProviderConfig {
    #[serde(default)]
    pub kind: RawProviderKind,

    pub base_url: Option<String>,

    /// Name of the environment variable holding the bearer token
    pub token_env: Option<String>,

    /// Per-attempt timeout
    pub timeout_seconds: Option<u64>,

    /// Retries after the first attempt for transient failures
    pub max_retries: Option<u32>,

    pub backoff_initial_ms: Option<u64>,

    pub backoff_max_ms: Option<u64>,

    pub start_mode: Option<String>,

    /// Page size when listing provider instances
    pub page_size: Option<u32>,
}

/// Raw user definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawUser {
    pub id: String,

    /// "admin" or "participant"
    #[serde(default = "default_role")]
    pub role: String,

    /// Admin who owns this user
    pub owner: Option<String>,
}

fn default_role() -> String {
    "participant".to_string()
}

/// Raw instance definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawInstance {
    /// Provider instance UUID
    pub uuid: String,

    /// Provider numeric instance id
    pub provider_id: u64,

    #[serde(default)]
    pub nickname: String,

    /// URL surfaced to the user once the instance is running
    pub target_url: String,

    /// User id this instance is assigned to
    pub assigned_to: Option<String>,
}
