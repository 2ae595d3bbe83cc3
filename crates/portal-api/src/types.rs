//! Shared types for the portald API

use chrono::{DateTime, Utc};
use portal_util::{InstanceId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-user lifecycle phase of the assigned instance
///
/// The machine has no terminal state. `Inactive` is the resting state
/// and every user starts there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Inactive => "inactive",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        }
    }

    /// Starting and Stopping are waiting on the provider
    pub fn is_transitional(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Stopping)
    }

    /// Whether `self -> next` is an edge of the session machine
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Inactive, Starting)
                | (Starting, Active)
                | (Starting, Inactive)
                | (Starting, Stopping)
                | (Active, Stopping)
                | (Stopping, Inactive)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown session state: {0}")]
pub struct ParseStateError(pub String);

impl std::str::FromStr for SessionState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(SessionState::Inactive),
            "starting" => Ok(SessionState::Starting),
            "active" => Ok(SessionState::Active),
            "stopping" => Ok(SessionState::Stopping),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// Account role of a portal user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    Participant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Participant => "participant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "participant" => Some(Role::Participant),
            _ => None,
        }
    }
}

/// Why a stop was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The user pressed stop
    User,
    /// Heartbeat went stale
    Inactivity,
    /// Daily shutdown fired; ignores recorded state
    DailyShutdown,
    /// Admin released the user's instance
    InstanceReleased,
    /// Stuck in Stopping past the grace period
    Reconcile,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::User => "user",
            StopReason::Inactivity => "inactivity",
            StopReason::DailyShutdown => "daily_shutdown",
            StopReason::InstanceReleased => "instance_released",
            StopReason::Reconcile => "reconcile",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// View of a user and their session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub user_id: UserId,
    pub role: Role,
    pub owner: Option<UserId>,
    pub instance: Option<InstanceId>,
    pub state: SessionState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
}

/// View of a provisionable instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceView {
    pub uuid: InstanceId,
    /// Numeric id assigned by the provider
    pub provider_id: u64,
    pub nickname: String,
    pub target_url: String,
    pub assigned_user: Option<UserId>,
}

/// Result of a status poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub is_running: bool,
    /// URL to surface to the user once running
    pub target_url: String,
    /// Raw provider status code, if the provider reports one
    pub provider_status: Option<u8>,
    /// URL reported by the provider itself (e.g. the notebook URL)
    pub provider_url: Option<String>,
    pub state: SessionState,
}

/// Result of `RequestStart`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// Start was issued; poll for `Active`
    Starting,
    /// Not `Inactive`; nothing was done
    AlreadyInState { state: SessionState },
}

/// Result of `RequestStop`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// Provider confirmed the stop and the session is `Inactive`
    Stopped { attempts: u32 },
    /// Provider never confirmed; the session was finalised to `Inactive` anyway
    ForcedInactive { attempts: u32, error: String },
    /// Session was already `Inactive` but a provider stop was still sent
    StopSent,
    /// Nothing to do
    AlreadyInState { state: SessionState },
    /// Inactivity stop dropped because a heartbeat arrived in the meantime
    StillFresh,
}

impl StopOutcome {
    /// Whether this outcome ended a running session
    pub fn did_stop(&self) -> bool {
        matches!(
            self,
            StopOutcome::Stopped { .. } | StopOutcome::ForcedInactive { .. } | StopOutcome::StopSent
        )
    }
}

/// Result of `Heartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HeartbeatOutcome {
    Recorded { at: DateTime<Utc> },
    /// Session not `Active`; the timestamp was left alone
    Ignored { state: SessionState },
}

/// Counts from one reaper, reconcile, or shutdown sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub considered: usize,
    pub stopped: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Daily shutdown schedule status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleView {
    pub enabled: bool,
    /// Wall-clock time, `HH:MM`
    pub at: String,
    /// Fixed UTC offset, `+HH:MM`
    pub utc_offset: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fired: Option<DateTime<Utc>>,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// HTTP gateway acting on behalf of an authenticated user
    Gateway,
    /// Local admin - can also list users and change assignments
    Admin,
}

impl ClientRole {
    pub fn can_act_for_users(&self) -> bool {
        matches!(self, ClientRole::Gateway | ClientRole::Admin)
    }

    pub fn can_list_users(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }

    pub fn can_manage_assignments(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub provider: String,
    pub provider_ok: bool,
    pub store_ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_edges() {
        use SessionState::*;
        assert!(Inactive.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Active));
        assert!(Active.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Inactive));

        assert!(!Inactive.can_transition_to(Active));
        assert!(!Active.can_transition_to(Starting));
        assert!(!Inactive.can_transition_to(Stopping));
    }

    #[test]
    fn session_state_string_form() {
        for state in [
            SessionState::Inactive,
            SessionState::Starting,
            SessionState::Active,
            SessionState::Stopping,
        ] {
            assert_eq!(state.as_str().parse::<SessionState>().unwrap(), state);
        }
        assert!("running".parse::<SessionState>().is_err());
    }

    #[test]
    fn outcome_serialization() {
        let outcome = StartOutcome::AlreadyInState {
            state: SessionState::Active,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert_eq!(json, r#"{"outcome":"already_in_state","state":"active"}"#);

        let stop = StopOutcome::ForcedInactive {
            attempts: 3,
            error: "timeout".into(),
        };
        assert!(stop.did_stop());
        assert!(!StopOutcome::StillFresh.did_stop());
    }

    #[test]
    fn client_role_permissions() {
        assert!(ClientRole::Gateway.can_act_for_users());
        assert!(!ClientRole::Gateway.can_manage_assignments());
        assert!(ClientRole::Admin.can_manage_assignments());
        assert!(ClientRole::Admin.can_list_users());
    }
}
