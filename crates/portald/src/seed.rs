//! Seeding the store from configuration

use anyhow::{Context, Result};
use portal_config::PortalConfig;
use portal_store::{InstanceRecord, Store};
use tracing::{debug, info, warn};

/// What seeding changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub users_created: usize,
    pub instances: usize,
    pub assignments_made: usize,
    pub assignments_skipped: usize,
}

/// Insert configured users and instances, then apply configured
/// assignments that do not conflict with what the store already holds.
///
/// Idempotent: session fields of existing users are never touched and an
/// existing assignment is left in place.
pub fn seed_store(store: &dyn Store, config: &PortalConfig) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    for user in &config.users {
        let created = store
            .ensure_user(&user.id, user.role, user.owner.as_ref())
            .with_context(|| format!("Failed to seed user {}", user.id))?;
        if created {
            report.users_created += 1;
        }
    }

    for seed in &config.instances {
        store
            .ensure_instance(&InstanceRecord {
                uuid: seed.uuid.clone(),
                provider_id: seed.provider_id,
                nickname: seed.nickname.clone(),
                target_url: seed.target_url.clone(),
                assigned_user: None,
            })
            .with_context(|| format!("Failed to seed instance {}", seed.uuid))?;
        report.instances += 1;
    }

    for seed in &config.instances {
        let Some(user) = &seed.assigned_to else {
            continue;
        };

        let current = store.instance_for_user(user)?;
        if let Some(current) = current {
            if current.uuid != seed.uuid {
                warn!(
                    user_id = %user,
                    configured = %seed.uuid,
                    current = %current.uuid,
                    "User already holds another instance, keeping it"
                );
                report.assignments_skipped += 1;
            } else {
                debug!(user_id = %user, instance = %seed.uuid, "Assignment already in place");
            }
            continue;
        }

        if let Some(holder) = store
            .get_instance(&seed.uuid)?
            .and_then(|i| i.assigned_user)
        {
            warn!(
                instance = %seed.uuid,
                configured = %user,
                holder = %holder,
                "Instance already assigned to another user, keeping it"
            );
            report.assignments_skipped += 1;
            continue;
        }

        store
            .assign(user, &seed.uuid, None)
            .with_context(|| format!("Failed to assign {} to {}", seed.uuid, user))?;
        report.assignments_made += 1;
    }

    info!(
        users = config.users.len(),
        users_created = report.users_created,
        instances = report.instances,
        assignments_made = report.assignments_made,
        assignments_skipped = report.assignments_skipped,
        "Store seeded from configuration"
    );
    Ok(report)
}
