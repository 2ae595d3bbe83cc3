//! Store trait definitions

use chrono::{DateTime, Utc};
use portal_api::{InstanceView, Role, SessionState, UserView};
use portal_util::{InstanceId, UserId};

use crate::{AuditEvent, StoreResult};

/// Main store trait
pub trait Store: Send + Sync {
    // Users

    /// Insert a user, or update role and owner of an existing one.
    /// Session fields of an existing user are never touched.
    /// Returns true if the user was created.
    fn ensure_user(&self, id: &UserId, role: Role, owner: Option<&UserId>) -> StoreResult<bool>;

    fn get_user(&self, id: &UserId) -> StoreResult<Option<UserRecord>>;

    fn list_users(&self) -> StoreResult<Vec<UserRecord>>;

    /// Users whose recorded session is in `state`
    fn users_in_state(&self, state: SessionState) -> StoreResult<Vec<UserRecord>>;

    /// Users holding an instance, regardless of session state
    fn users_with_assignment(&self) -> StoreResult<Vec<UserRecord>>;

    /// The only writer of a user's session fields
    fn save_session(&self, id: &UserId, session: &SessionRecord) -> StoreResult<()>;

    // Instances

    /// Insert an instance, or update its provider id, nickname and target
    /// URL. The assignment is left alone.
    fn ensure_instance(&self, instance: &InstanceRecord) -> StoreResult<()>;

    fn get_instance(&self, uuid: &InstanceId) -> StoreResult<Option<InstanceRecord>>;

    fn list_instances(&self) -> StoreResult<Vec<InstanceRecord>>;

    /// Instance assigned to `user`, if any
    fn instance_for_user(&self, user: &UserId) -> StoreResult<Option<InstanceRecord>>;

    // Assignment

    /// Link user and instance in both directions, in one transaction.
    /// Fails if either side is already linked, or if `owner_limit` is set
    /// and the user's owner already has that many assigned users.
    fn assign(
        &self,
        user: &UserId,
        instance: &InstanceId,
        owner_limit: Option<u32>,
    ) -> StoreResult<()>;

    /// Clear both directions of the user's assignment.
    /// Returns the instance that was released, if any.
    fn release(&self, user: &UserId) -> StoreResult<Option<InstanceId>>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Session fields of a user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub state: SessionState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Move to `state`, stamping the transition time
    pub fn transition(&mut self, state: SessionState, now: DateTime<Utc>) {
        self.state = state;
        self.last_transition = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub role: Role,
    pub owner: Option<UserId>,
    pub instance: Option<InstanceId>,
    pub session: SessionRecord,
}

impl UserRecord {
    pub fn to_view(&self) -> UserView {
        UserView {
            user_id: self.id.clone(),
            role: self.role,
            owner: self.owner.clone(),
            instance: self.instance.clone(),
            state: self.session.state,
            last_heartbeat: self.session.last_heartbeat,
            last_transition: self.session.last_transition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub uuid: InstanceId,
    pub provider_id: u64,
    pub nickname: String,
    pub target_url: String,
    pub assigned_user: Option<UserId>,
}

impl InstanceRecord {
    pub fn to_view(&self) -> InstanceView {
        InstanceView {
            uuid: self.uuid.clone(),
            provider_id: self.provider_id,
            nickname: self.nickname.clone(),
            target_url: self.target_url.clone(),
            assigned_user: self.assigned_user.clone(),
        }
    }
}
