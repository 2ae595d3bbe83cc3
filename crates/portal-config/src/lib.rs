//! Configuration parsing and validation for portald
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Controller, reaper and daily shutdown settings
//! - Provider connection and retry settings
//! - Seed users and instances with their assignments
//! - Validation with clear error messages

mod config;
mod schema;
mod validation;

pub use config::*;
pub use schema::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<PortalConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<PortalConfig> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let errors = validate_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(PortalConfig::from_raw(raw))
}

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_minimal_config() {
        let config = r#"
            config_version = 1

            [[users]]
            id = "demo"

            [[instances]]
            uuid = "gghcmwa6-emgm7485"
            provider_id = 7764
            nickname = "demo-box"
            target_url = "https://example.com/lab"
            assigned_to = "demo"
        "#;

        let config = parse_config(config).unwrap();
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].id.as_str(), "demo");
        let seed = config.instance_for(&config.users[0].id).unwrap();
        assert_eq!(seed.uuid.as_str(), "gghcmwa6-emgm7485");
    }

    #[test]
    fn reject_wrong_version() {
        let config = r#"
            config_version = 99
        "#;

        let result = parse_config(config);
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn reports_all_validation_errors() {
        let config = r#"
            config_version = 1

            [shutdown]
            at = "25:00"
            utc_offset = "Asia/Shanghai"
        "#;

        match parse_config(config) {
            Err(ConfigError::ValidationFailed { errors }) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "config_version = 1\n[provider]\nkind = \"mock\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Mock);
    }
}
