//! Instance registry: exclusive user <-> instance assignment

use portal_api::InstanceView;
use portal_provider_api::InstanceRef;
use portal_store::{AuditEvent, AuditEventType, InstanceRecord, Store, StoreError, UserRecord};
use portal_util::{InstanceId, PortalError, Result, UserId};
use std::sync::Arc;
use tracing::{info, warn};

/// Assignment bookkeeping on top of the store.
///
/// Both directions of an assignment are written in one store transaction,
/// so at most one user holds an instance and a user holds at most one.
pub struct InstanceRegistry {
    store: Arc<dyn Store>,
    max_assignments_per_owner: Option<u32>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn Store>, max_assignments_per_owner: Option<u32>) -> Self {
        Self {
            store,
            max_assignments_per_owner,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn user(&self, user: &UserId) -> Result<UserRecord> {
        self.store
            .get_user(user)?
            .ok_or_else(|| PortalError::UserNotFound(user.clone()))
    }

    fn instance(&self, uuid: &InstanceId) -> Result<InstanceRecord> {
        self.store
            .get_instance(uuid)?
            .ok_or_else(|| PortalError::InstanceNotFound(uuid.clone()))
    }

    /// Instance assigned to `user`, or `None`. Fails for unknown users.
    pub fn lookup(&self, user: &UserId) -> Result<Option<InstanceRecord>> {
        self.user(user)?;
        Ok(self.store.instance_for_user(user)?)
    }

    /// Provider reference of the user's instance; no instance is a
    /// validation failure
    pub fn instance_ref(&self, user: &UserId) -> Result<(InstanceRecord, InstanceRef)> {
        let instance = self
            .store
            .instance_for_user(user)?
            .ok_or_else(|| PortalError::NoInstanceAssigned(user.clone()))?;
        let instance_ref = InstanceRef::new(instance.uuid.clone(), instance.provider_id);
        Ok((instance, instance_ref))
    }

    /// Link `user` and `instance`. Fails if either side is already linked
    /// or the user's owner is at the assignment limit.
    pub fn assign(&self, user: &UserId, uuid: &InstanceId) -> Result<InstanceView> {
        let record = self.user(user)?;
        let instance = self.instance(uuid)?;

        if let Some(held) = &record.instance {
            return Err(PortalError::validation(format!(
                "user {user} already holds instance {held}"
            )));
        }
        if let Some(holder) = &instance.assigned_user {
            return Err(PortalError::validation(format!(
                "instance {uuid} is already assigned to {holder}"
            )));
        }

        match self.store.assign(user, uuid, self.max_assignments_per_owner) {
            Ok(()) => {}
            Err(e @ StoreError::OwnerLimit { .. }) => {
                warn!(user_id = %user, error = %e, "Assignment limit reached");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
        self.audit(AuditEventType::InstanceAssigned {
            user_id: user.clone(),
            instance: uuid.clone(),
        });
        info!(user_id = %user, instance = %uuid, "Instance assigned");

        let mut view = instance.to_view();
        view.assigned_user = Some(user.clone());
        Ok(view)
    }

    /// Clear the user's assignment. Session state is not consulted here;
    /// callers must bring the session to `Inactive` first.
    pub fn release(&self, user: &UserId) -> Result<Option<InstanceId>> {
        self.user(user)?;
        let released = self.store.release(user)?;

        if let Some(instance) = &released {
            self.audit(AuditEventType::InstanceReleased {
                user_id: user.clone(),
                instance: instance.clone(),
            });
            info!(user_id = %user, instance = %instance, "Instance released");
        }

        Ok(released)
    }

    fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_api::Role;
    use portal_store::SqliteStore;

    fn setup(limit: Option<u32>) -> InstanceRegistry {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let admin = UserId::new("admin");
        store.ensure_user(&admin, Role::Admin, None).unwrap();
        for name in ["alice", "bob", "carol"] {
            store
                .ensure_user(&UserId::new(name), Role::Participant, Some(&admin))
                .unwrap();
        }
        for (uuid, id) in [("inst-a", 1), ("inst-b", 2), ("inst-c", 3)] {
            store
                .ensure_instance(&InstanceRecord {
                    uuid: InstanceId::new(uuid),
                    provider_id: id,
                    nickname: uuid.to_uppercase(),
                    target_url: format!("https://lab.example.com/{id}"),
                    assigned_user: None,
                })
                .unwrap();
        }
        InstanceRegistry::new(store, limit)
    }

    #[test]
    fn assign_and_lookup() {
        let registry = setup(None);
        let alice = UserId::new("alice");

        assert!(registry.lookup(&alice).unwrap().is_none());
        let view = registry.assign(&alice, &InstanceId::new("inst-a")).unwrap();
        assert_eq!(view.assigned_user, Some(alice.clone()));

        let found = registry.lookup(&alice).unwrap().unwrap();
        assert_eq!(found.uuid, InstanceId::new("inst-a"));

        let (_, instance_ref) = registry.instance_ref(&alice).unwrap();
        assert_eq!(instance_ref.provider_id, 1);
    }

    #[test]
    fn assignment_is_one_to_one() {
        let registry = setup(None);
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        registry.assign(&alice, &InstanceId::new("inst-a")).unwrap();

        // Instance already taken
        let err = registry.assign(&bob, &InstanceId::new("inst-a")).unwrap_err();
        assert!(err.is_validation());

        // User already holds one
        let err = registry.assign(&alice, &InstanceId::new("inst-b")).unwrap_err();
        assert!(err.is_validation());

        // Release then reassign round-trips
        assert_eq!(
            registry.release(&alice).unwrap(),
            Some(InstanceId::new("inst-a"))
        );
        registry.assign(&bob, &InstanceId::new("inst-a")).unwrap();
        registry.assign(&alice, &InstanceId::new("inst-b")).unwrap();

        let instances = registry.store().list_instances().unwrap();
        for instance in instances {
            let holders = registry
                .store()
                .list_users()
                .unwrap()
                .into_iter()
                .filter(|u| u.instance.as_ref() == Some(&instance.uuid))
                .count();
            assert!(holders <= 1);
        }
    }

    #[test]
    fn release_without_assignment() {
        let registry = setup(None);
        assert_eq!(registry.release(&UserId::new("alice")).unwrap(), None);
    }

    #[test]
    fn unknown_ids() {
        let registry = setup(None);
        assert!(matches!(
            registry.lookup(&UserId::new("ghost")),
            Err(PortalError::UserNotFound(_))
        ));
        assert!(matches!(
            registry.assign(&UserId::new("alice"), &InstanceId::new("nope")),
            Err(PortalError::InstanceNotFound(_))
        ));
        assert!(matches!(
            registry.instance_ref(&UserId::new("alice")),
            Err(PortalError::NoInstanceAssigned(_))
        ));
    }

    #[test]
    fn owner_limit() {
        let registry = setup(Some(2));
        registry
            .assign(&UserId::new("alice"), &InstanceId::new("inst-a"))
            .unwrap();
        registry
            .assign(&UserId::new("bob"), &InstanceId::new("inst-b"))
            .unwrap();

        let err = registry
            .assign(&UserId::new("carol"), &InstanceId::new("inst-c"))
            .unwrap_err();
        assert!(err.is_validation());
    }
}
