//! Validated configuration structures

use crate::schema::{
    RawConfig, RawControllerConfig, RawInstance, RawProviderConfig, RawProviderKind,
    RawServiceConfig, RawShutdownConfig, RawUser,
};
use crate::validation::{parse_time, parse_utc_offset};
use chrono::{Offset, Utc};
use portal_api::Role;
use portal_util::{DailySchedule, InstanceId, UserId, WallClock};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_INACTIVITY_TIMEOUT_MINUTES: u64 = 180;
pub const DEFAULT_REAPER_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 4;
pub const DEFAULT_STOP_ATTEMPTS: u32 = 3;
pub const DEFAULT_STOP_RETRY_DELAY_SECONDS: u64 = 2;
pub const DEFAULT_STUCK_STOPPING_GRACE_SECONDS: u64 = 600;
pub const DEFAULT_MAX_ASSIGNMENTS_PER_OWNER: u32 = 15;

pub const DEFAULT_SHUTDOWN_AT: &str = "02:00";
pub const DEFAULT_SHUTDOWN_UTC_OFFSET: &str = "+08:00";

pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://www.gpufree.cn/api/v1";
pub const DEFAULT_PROVIDER_TOKEN_ENV: &str = "GPUFREE_BEARER_TOKEN";
pub const DEFAULT_PROVIDER_TIMEOUT_SECONDS: u64 = 15;
pub const DEFAULT_PROVIDER_MAX_RETRIES: u32 = 2;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5000;
pub const DEFAULT_START_MODE: &str = "gpu";
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Validated configuration ready for use by the service
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub service: ServiceConfig,
    pub controller: ControllerConfig,
    pub shutdown: ShutdownConfig,
    pub provider: ProviderConfig,
    pub users: Vec<UserSeed>,
    pub instances: Vec<InstanceSeed>,
}

impl PortalConfig {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            controller: ControllerConfig::from_raw(raw.controller),
            shutdown: ShutdownConfig::from_raw(raw.shutdown),
            provider: ProviderConfig::from_raw(raw.provider),
            users: raw.users.into_iter().map(UserSeed::from_raw).collect(),
            instances: raw.instances.into_iter().map(InstanceSeed::from_raw).collect(),
        }
    }

    /// Seeded instance assigned to `user`, if any
    pub fn instance_for(&self, user: &UserId) -> Option<&InstanceSeed> {
        self.instances
            .iter()
            .find(|i| i.assigned_to.as_ref() == Some(user))
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw
                .socket_path
                .unwrap_or_else(portal_util::default_socket_path),
            data_dir: raw.data_dir.unwrap_or_else(portal_util::default_data_dir),
        }
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("portal.db")
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub inactivity_timeout: Duration,
    pub reaper_interval: Duration,
    pub sweep_concurrency: usize,
    pub stop_attempts: u32,
    /// Pause between controller-level stop attempts
    pub stop_retry_delay: Duration,
    pub stuck_stopping_grace: Duration,
    /// None means unlimited
    pub max_assignments_per_owner: Option<u32>,
}

impl ControllerConfig {
    fn from_raw(raw: RawControllerConfig) -> Self {
        let max = raw
            .max_assignments_per_owner
            .unwrap_or(DEFAULT_MAX_ASSIGNMENTS_PER_OWNER);
        Self {
            inactivity_timeout: Duration::from_secs(
                raw.inactivity_timeout_minutes
                    .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT_MINUTES)
                    * 60,
            ),
            reaper_interval: Duration::from_secs(
                raw.reaper_interval_seconds
                    .unwrap_or(DEFAULT_REAPER_INTERVAL_SECONDS),
            ),
            sweep_concurrency: raw.sweep_concurrency.unwrap_or(DEFAULT_SWEEP_CONCURRENCY),
            stop_attempts: raw.stop_attempts.unwrap_or(DEFAULT_STOP_ATTEMPTS),
            stop_retry_delay: Duration::from_secs(
                raw.stop_retry_delay_seconds
                    .unwrap_or(DEFAULT_STOP_RETRY_DELAY_SECONDS),
            ),
            stuck_stopping_grace: Duration::from_secs(
                raw.stuck_stopping_grace_seconds
                    .unwrap_or(DEFAULT_STUCK_STOPPING_GRACE_SECONDS),
            ),
            max_assignments_per_owner: if max == 0 { None } else { Some(max) },
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_raw(RawControllerConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    pub enabled: bool,
    pub schedule: DailySchedule,
}

impl ShutdownConfig {
    fn from_raw(raw: RawShutdownConfig) -> Self {
        // Validation has already rejected malformed strings
        let at = raw
            .at
            .as_deref()
            .and_then(|s| parse_time(s).ok())
            .or_else(|| parse_time(DEFAULT_SHUTDOWN_AT).ok())
            .unwrap_or(WallClock { hour: 2, minute: 0 });
        let offset = raw
            .utc_offset
            .as_deref()
            .and_then(|s| parse_utc_offset(s).ok())
            .or_else(|| parse_utc_offset(DEFAULT_SHUTDOWN_UTC_OFFSET).ok())
            .unwrap_or_else(|| Utc.fix());

        Self {
            enabled: raw.enabled.unwrap_or(true),
            schedule: DailySchedule::new(at, offset),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::from_raw(RawShutdownConfig::default())
    }
}

/// Which provider backend the service uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gpufree,
    Mock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    /// Environment variable the bearer token is read from
    pub token_env: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub start_mode: String,
    pub page_size: u32,
}

impl ProviderConfig {
    fn from_raw(raw: RawProviderConfig) -> Self {
        Self {
            kind: match raw.kind {
                RawProviderKind::Gpufree => ProviderKind::Gpufree,
                RawProviderKind::Mock => ProviderKind::Mock,
            },
            base_url: raw
                .base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string()),
            token_env: raw
                .token_env
                .unwrap_or_else(|| DEFAULT_PROVIDER_TOKEN_ENV.to_string()),
            timeout: Duration::from_secs(
                raw.timeout_seconds.unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECONDS),
            ),
            max_retries: raw.max_retries.unwrap_or(DEFAULT_PROVIDER_MAX_RETRIES),
            backoff_initial: Duration::from_millis(
                raw.backoff_initial_ms.unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
            ),
            backoff_max: Duration::from_millis(raw.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS)),
            start_mode: raw
                .start_mode
                .unwrap_or_else(|| DEFAULT_START_MODE.to_string()),
            page_size: raw.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    /// Read the bearer token from the configured environment variable
    pub fn token_from_env(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::from_raw(RawProviderConfig::default())
    }
}

/// User record seeded at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSeed {
    pub id: UserId,
    pub role: Role,
    pub owner: Option<UserId>,
}

impl UserSeed {
    fn from_raw(raw: RawUser) -> Self {
        Self {
            id: UserId::new(raw.id),
            role: Role::parse(&raw.role).unwrap_or_default(),
            owner: raw.owner.map(UserId::new),
        }
    }
}

/// Instance record seeded at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSeed {
    pub uuid: InstanceId,
    pub provider_id: u64,
    pub nickname: String,
    pub target_url: String,
    pub assigned_to: Option<UserId>,
}

impl InstanceSeed {
    fn from_raw(raw: RawInstance) -> Self {
        Self {
            uuid: InstanceId::new(raw.uuid),
            provider_id: raw.provider_id,
            nickname: raw.nickname,
            target_url: raw.target_url,
            assigned_to: raw.assigned_to.map(UserId::new),
        }
    }
}
