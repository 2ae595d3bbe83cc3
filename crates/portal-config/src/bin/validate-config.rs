//! Config validation CLI tool
//!
//! Validates a portald configuration file and reports any errors.

use portal_config::{ConfigError, CURRENT_CONFIG_VERSION, ProviderKind};
use portal_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a portald configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            eprintln!("  validate-config config.example.toml");
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match portal_config::load_config(&config_path) {
        Ok(config) => {
            let assigned = config
                .instances
                .iter()
                .filter(|i| i.assigned_to.is_some())
                .count();

            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", CURRENT_CONFIG_VERSION);
            println!(
                "  Provider: {}",
                match config.provider.kind {
                    ProviderKind::Gpufree => format!("gpufree ({})", config.provider.base_url),
                    ProviderKind::Mock => "mock".to_string(),
                }
            );
            println!(
                "  Inactivity timeout: {}",
                portal_util::format_duration(config.controller.inactivity_timeout)
            );
            if config.shutdown.enabled {
                println!("  Daily shutdown: {}", config.shutdown.schedule);
            } else {
                println!("  Daily shutdown: disabled");
            }
            println!("  Users: {}", config.users.len());
            println!("  Instances: {} ({} assigned)", config.instances.len(), assigned);

            if !config.instances.is_empty() {
                println!();
                println!("Instances:");
                for instance in &config.instances {
                    let owner = instance
                        .assigned_to
                        .as_ref()
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| "unassigned".to_string());
                    println!(
                        "  - {} [{}] {}: {}",
                        instance.uuid, instance.provider_id, instance.nickname, owner
                    );
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver, CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
