//! Event types for portald -> client streaming

use chrono::{DateTime, Utc};
use portal_util::{InstanceId, UserId};
use serde::{Deserialize, Serialize};

use crate::{API_VERSION, SessionState, StopReason, SweepSummary};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: portal_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A user's session moved along an edge of the state machine
    SessionStateChanged {
        user_id: UserId,
        from: SessionState,
        to: SessionState,
        /// Set for transitions caused by a stop
        reason: Option<StopReason>,
    },

    /// A provider call failed for a user
    ProviderFailed {
        user_id: UserId,
        operation: String,
        transient: bool,
        message: String,
    },

    InstanceAssigned {
        user_id: UserId,
        instance: InstanceId,
    },

    InstanceReleased {
        user_id: UserId,
        instance: InstanceId,
    },

    /// Inactivity reaper finished a cycle
    ReaperSwept { summary: SweepSummary },

    /// Users stuck in Stopping were reconciled
    StoppingReconciled { summary: SweepSummary },

    /// The daily shutdown fired
    DailyShutdownFired {
        summary: SweepSummary,
        next_fire: DateTime<Utc>,
    },

    /// Service is shutting down
    Shutdown,
}
