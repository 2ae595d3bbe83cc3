//! Command types for the portald protocol

use portal_util::{ClientId, InstanceId, PortalError, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    API_VERSION, ClientRole, HealthStatus, HeartbeatOutcome, InstanceView, ScheduleView,
    StartOutcome, StatusView, StopOutcome, UserView,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&PortalError> for ErrorInfo {
    fn from(err: &PortalError) -> Self {
        let code = match err {
            PortalError::UserNotFound(_) => ErrorCode::UserNotFound,
            PortalError::InstanceNotFound(_) => ErrorCode::InstanceNotFound,
            PortalError::NoInstanceAssigned(_) => ErrorCode::NoInstanceAssigned,
            PortalError::ValidationError(_) => ErrorCode::ValidationFailed,
            PortalError::ProviderError { transient: true, .. } => ErrorCode::ProviderTransient,
            PortalError::ProviderError { transient: false, .. } => ErrorCode::ProviderPermanent,
            PortalError::InstanceBusy(_) => ErrorCode::InstanceBusy,
            PortalError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            PortalError::RateLimited => ErrorCode::RateLimited,
            PortalError::ConfigError(_) => ErrorCode::ConfigError,
            PortalError::StoreError(_) => ErrorCode::StoreError,
            PortalError::IpcError(_) | PortalError::Internal(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    UserNotFound,
    InstanceNotFound,
    NoInstanceAssigned,
    ValidationFailed,
    /// Provider call failed but may succeed if retried later
    ProviderTransient,
    ProviderPermanent,
    InstanceBusy,
    PermissionDenied,
    RateLimited,
    ConfigError,
    StoreError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Start the user's assigned instance
    RequestStart { user_id: UserId },

    /// Stop the user's assigned instance
    RequestStop { user_id: UserId },

    /// Liveness signal from the user's browser session
    Heartbeat { user_id: UserId },

    /// Ask the provider whether the instance is up yet
    PollStatus { user_id: UserId },

    GetUser { user_id: UserId },

    /// Instance assigned to a user, if any
    Lookup { user_id: UserId },

    GetSchedule,

    /// Get health status
    GetHealth,

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    /// Unsubscribe from events
    UnsubscribeEvents,

    // Admin commands

    /// List all users (admin only)
    ListUsers,

    /// Assign an instance to a user (admin only)
    Assign {
        user_id: UserId,
        instance: InstanceId,
    },

    /// Clear a user's assignment, stopping the instance first (admin only)
    Release { user_id: UserId },

    /// Ping for keepalive
    Ping,
}

impl Command {
    /// Whether this command needs the admin role
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::ListUsers | Command::Assign { .. } | Command::Release { .. }
        )
    }
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Start { outcome: StartOutcome },
    Stop { outcome: StopOutcome },
    Heartbeat { outcome: HeartbeatOutcome },
    Status(StatusView),
    User(UserView),
    Users { users: Vec<UserView> },
    Instance { instance: Option<InstanceView> },
    Assigned {
        user_id: UserId,
        instance: InstanceId,
    },
    Released {
        user_id: UserId,
        instance: InstanceId,
        stop: StopOutcome,
    },
    Schedule(ScheduleView),
    Health(HealthStatus),
    Subscribed {
        client_id: ClientId,
    },
    Unsubscribed,
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
    /// Process id if available
    pub pid: Option<i32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
            pid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionState;

    #[test]
    fn request_serialization() {
        let req = Request::new(
            1,
            Command::RequestStart {
                user_id: UserId::new("demo"),
            },
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""type":"request_start""#));

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, 1);
        assert!(matches!(parsed.command, Command::RequestStart { .. }));
    }

    #[test]
    fn response_with_nested_outcome() {
        let resp = Response::success(
            7,
            ResponsePayload::Stop {
                outcome: StopOutcome::AlreadyInState {
                    state: SessionState::Inactive,
                },
            },
        );

        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.request_id, 7);
        match parsed.result {
            ResponseResult::Ok(ResponsePayload::Stop { outcome }) => {
                assert_eq!(
                    outcome,
                    StopOutcome::AlreadyInState {
                        state: SessionState::Inactive
                    }
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn empty_lookup_serializes() {
        let resp = Response::success(2, ResponsePayload::Instance { instance: None });
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed.result,
            ResponseResult::Ok(ResponsePayload::Instance { instance: None })
        ));
    }

    #[test]
    fn portal_error_maps_to_code() {
        let info = ErrorInfo::from(&PortalError::provider(true, "timed out"));
        assert_eq!(info.code, ErrorCode::ProviderTransient);

        let info = ErrorInfo::from(&PortalError::NoInstanceAssigned(UserId::new("demo")));
        assert_eq!(info.code, ErrorCode::NoInstanceAssigned);
    }

    #[test]
    fn admin_commands() {
        assert!(Command::ListUsers.requires_admin());
        assert!(!Command::Heartbeat {
            user_id: UserId::new("demo")
        }
        .requires_admin());
    }
}
