//! Configuration validation

use crate::schema::{RawConfig, RawProviderKind};
use crate::DEFAULT_MAX_ASSIGNMENTS_PER_OWNER;
use chrono::FixedOffset;
use portal_api::Role;
use portal_util::WallClock;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("User '{user_id}': {message}")]
    UserError { user_id: String, message: String },

    #[error("Instance '{uuid}': {message}")]
    InstanceError { uuid: String, message: String },

    #[error("Duplicate user ID: {0}")]
    DuplicateUserId(String),

    #[error("Duplicate instance UUID: {0}")]
    DuplicateInstanceUuid(String),

    #[error("User '{user_id}' is assigned more than one instance: {first}, {second}")]
    MultipleAssignments {
        user_id: String,
        first: String,
        second: String,
    },

    #[error("Owner '{owner}' has {count} assigned users (limit {limit})")]
    OwnerLimitExceeded {
        owner: String,
        count: u32,
        limit: u32,
    },

    #[error("Invalid time format '{value}': {message}")]
    InvalidTimeFormat { value: String, message: String },

    #[error("Invalid UTC offset '{value}': {message}")]
    InvalidUtcOffset { value: String, message: String },

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    errors.extend(validate_controller(config));
    errors.extend(validate_shutdown(config));
    errors.extend(validate_provider(config));
    errors.extend(validate_users(config));
    errors.extend(validate_instances(config));

    errors
}

fn validate_controller(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let c = &config.controller;

    let zero_checks = [
        ("inactivity_timeout_minutes", c.inactivity_timeout_minutes.map(|v| v == 0)),
        ("reaper_interval_seconds", c.reaper_interval_seconds.map(|v| v == 0)),
        ("sweep_concurrency", c.sweep_concurrency.map(|v| v == 0)),
        ("stop_attempts", c.stop_attempts.map(|v| v == 0)),
        ("stuck_stopping_grace_seconds", c.stuck_stopping_grace_seconds.map(|v| v == 0)),
    ];
    for (name, is_zero) in zero_checks {
        if is_zero == Some(true) {
            errors.push(ValidationError::GlobalError(format!(
                "controller.{} must be greater than zero",
                name
            )));
        }
    }

    errors
}

fn validate_shutdown(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(at) = &config.shutdown.at
        && let Err(message) = parse_time(at)
    {
        errors.push(ValidationError::InvalidTimeFormat {
            value: at.clone(),
            message,
        });
    }

    if let Some(offset) = &config.shutdown.utc_offset
        && let Err(message) = parse_utc_offset(offset)
    {
        errors.push(ValidationError::InvalidUtcOffset {
            value: offset.clone(),
            message,
        });
    }

    errors
}

fn validate_provider(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let p = &config.provider;

    if let Some(url) = &p.base_url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        errors.push(ValidationError::GlobalError(format!(
            "provider.base_url must be an http(s) URL, got '{}'",
            url
        )));
    }

    if p.kind == RawProviderKind::Gpufree
        && let Some(token_env) = &p.token_env
        && token_env.trim().is_empty()
    {
        errors.push(ValidationError::GlobalError(
            "provider.token_env cannot be empty for the gpufree provider".into(),
        ));
    }

    if p.timeout_seconds == Some(0) {
        errors.push(ValidationError::GlobalError(
            "provider.timeout_seconds must be greater than zero".into(),
        ));
    }

    if p.page_size == Some(0) {
        errors.push(ValidationError::GlobalError(
            "provider.page_size must be greater than zero".into(),
        ));
    }

    if let (Some(initial), Some(max)) = (p.backoff_initial_ms, p.backoff_max_ms)
        && initial > max
    {
        errors.push(ValidationError::GlobalError(format!(
            "provider.backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
            initial, max
        )));
    }

    if let Some(mode) = &p.start_mode
        && mode.trim().is_empty()
    {
        errors.push(ValidationError::GlobalError(
            "provider.start_mode cannot be empty".into(),
        ));
    }

    errors
}

fn validate_users(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for user in &config.users {
        if user.id.trim().is_empty() {
            errors.push(ValidationError::GlobalError("user id cannot be empty".into()));
            continue;
        }
        if !seen.insert(user.id.as_str()) {
            errors.push(ValidationError::DuplicateUserId(user.id.clone()));
        }
        if Role::parse(&user.role).is_none() {
            errors.push(ValidationError::UserError {
                user_id: user.id.clone(),
                message: format!("unknown role '{}' (expected admin or participant)", user.role),
            });
        }
    }

    let roles: HashMap<&str, Option<Role>> = config
        .users
        .iter()
        .map(|u| (u.id.as_str(), Role::parse(&u.role)))
        .collect();

    for user in &config.users {
        let Some(owner) = &user.owner else { continue };
        match roles.get(owner.as_str()) {
            None => errors.push(ValidationError::UserError {
                user_id: user.id.clone(),
                message: format!("owner '{}' is not a configured user", owner),
            }),
            Some(Some(Role::Admin)) => {}
            Some(_) => errors.push(ValidationError::UserError {
                user_id: user.id.clone(),
                message: format!("owner '{}' is not an admin", owner),
            }),
        }
    }

    errors
}

fn validate_instances(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let user_ids: HashSet<&str> = config.users.iter().map(|u| u.id.as_str()).collect();
    let mut seen_uuids = HashSet::new();
    let mut seen_provider_ids = HashSet::new();
    let mut assignments: HashMap<&str, &str> = HashMap::new();

    for instance in &config.instances {
        if instance.uuid.trim().is_empty() {
            errors.push(ValidationError::GlobalError("instance uuid cannot be empty".into()));
            continue;
        }
        if !seen_uuids.insert(instance.uuid.as_str()) {
            errors.push(ValidationError::DuplicateInstanceUuid(instance.uuid.clone()));
        }
        if !seen_provider_ids.insert(instance.provider_id) {
            errors.push(ValidationError::InstanceError {
                uuid: instance.uuid.clone(),
                message: format!("provider_id {} is used by another instance", instance.provider_id),
            });
        }

        let Some(user) = &instance.assigned_to else { continue };
        if !user_ids.contains(user.as_str()) {
            errors.push(ValidationError::InstanceError {
                uuid: instance.uuid.clone(),
                message: format!("assigned_to '{}' is not a configured user", user),
            });
            continue;
        }
        if let Some(first) = assignments.insert(user.as_str(), instance.uuid.as_str()) {
            errors.push(ValidationError::MultipleAssignments {
                user_id: user.clone(),
                first: first.to_string(),
                second: instance.uuid.clone(),
            });
        }
    }

    let limit = config
        .controller
        .max_assignments_per_owner
        .unwrap_or(DEFAULT_MAX_ASSIGNMENTS_PER_OWNER);
    if limit > 0 {
        let mut per_owner: HashMap<&str, u32> = HashMap::new();
        for user in &config.users {
            if let Some(owner) = &user.owner
                && assignments.contains_key(user.id.as_str())
            {
                *per_owner.entry(owner.as_str()).or_default() += 1;
            }
        }
        let mut over: Vec<_> = per_owner.into_iter().filter(|(_, n)| *n > limit).collect();
        over.sort();
        for (owner, count) in over {
            errors.push(ValidationError::OwnerLimitExceeded {
                owner: owner.to_string(),
                count,
                limit,
            });
        }
    }

    errors
}

/// Parse HH:MM time format
pub fn parse_time(s: &str) -> Result<WallClock, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return Err("Expected HH:MM format".into());
    }

    let hour: u8 = parts[0]
        .parse()
        .map_err(|_| "Invalid hour".to_string())?;
    let minute: u8 = parts[1]
        .parse()
        .map_err(|_| "Invalid minute".to_string())?;

    if hour >= 24 {
        return Err("Hour must be 0-23".into());
    }
    if minute >= 60 {
        return Err("Minute must be 0-59".into());
    }

    WallClock::new(hour, minute).ok_or_else(|| "Invalid time".to_string())
}

/// Parse a fixed UTC offset: `+HH:MM`, `-HH:MM`, `Z` or `UTC`
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| "Invalid offset".to_string());
    }

    let (sign, rest) = match s.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err("Expected +HH:MM or -HH:MM".into()),
    };

    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| "Expected +HH:MM or -HH:MM".to_string())?;
    let hours: i32 = hours.parse().map_err(|_| "Invalid hours".to_string())?;
    let minutes: i32 = minutes.parse().map_err(|_| "Invalid minutes".to_string())?;

    if hours > 14 {
        return Err("Hours must be 0-14".into());
    }
    if minutes >= 60 {
        return Err("Minutes must be 0-59".into());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| "Offset out of range".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawInstance, RawUser};

    fn user(id: &str, role: &str, owner: Option<&str>) -> RawUser {
        RawUser {
            id: id.into(),
            role: role.into(),
            owner: owner.map(Into::into),
        }
    }

    fn instance(uuid: &str, provider_id: u64, assigned_to: Option<&str>) -> RawInstance {
        RawInstance {
            uuid: uuid.into(),
            provider_id,
            nickname: String::new(),
            target_url: "https://example.com".into(),
            assigned_to: assigned_to.map(Into::into),
        }
    }

    fn base() -> RawConfig {
        toml::from_str("config_version = 1").unwrap()
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("14:30").unwrap(), WallClock::new(14, 30).unwrap());
        assert_eq!(parse_time("00:00").unwrap(), WallClock::new(0, 0).unwrap());
        assert_eq!(parse_time("23:59").unwrap(), WallClock::new(23, 59).unwrap());

        assert!(parse_time("24:00").is_err());
        assert!(parse_time("12:60").is_err());
        assert!(parse_time("invalid").is_err());
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(parse_utc_offset("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 1800));
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);

        assert!(parse_utc_offset("08:00").is_err());
        assert!(parse_utc_offset("+8").is_err());
        assert!(parse_utc_offset("+15:00").is_err());
        assert!(parse_utc_offset("+08:75").is_err());
    }

    #[test]
    fn test_duplicate_id_detection() {
        let mut config = base();
        config.users = vec![user("demo", "participant", None), user("demo", "participant", None)];

        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateUserId(_))));
    }

    #[test]
    fn one_instance_per_user() {
        let mut config = base();
        config.users = vec![user("demo", "participant", None)];
        config.instances = vec![
            instance("a", 1, Some("demo")),
            instance("b", 2, Some("demo")),
        ];

        let errors = validate_config(&config);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::MultipleAssignments { .. })));
    }

    #[test]
    fn unknown_references_rejected() {
        let mut config = base();
        config.users = vec![
            user("demo", "participant", Some("ghost")),
            user("other", "participant", Some("demo")),
        ];
        config.instances = vec![instance("a", 1, Some("nobody"))];

        let errors = validate_config(&config);
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn owner_limit_enforced() {
        let mut config = base();
        config.controller.max_assignments_per_owner = Some(1);
        config.users = vec![
            user("admin", "admin", None),
            user("u1", "participant", Some("admin")),
            user("u2", "participant", Some("admin")),
        ];
        config.instances = vec![instance("a", 1, Some("u1")), instance("b", 2, Some("u2"))];

        let errors = validate_config(&config);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::OwnerLimitExceeded { count: 2, limit: 1, .. })));
    }

    #[test]
    fn zero_intervals_rejected() {
        let mut config = base();
        config.controller.reaper_interval_seconds = Some(0);
        config.controller.sweep_concurrency = Some(0);
        config.provider.token_env = Some("  ".into());

        let errors = validate_config(&config);
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }
}
