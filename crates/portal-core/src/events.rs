//! Core events emitted by the controller and its background tasks

use chrono::{DateTime, Utc};
use portal_api::{EventPayload, SessionState, StopReason, SweepSummary};
use portal_util::{InstanceId, UserId};

/// Events emitted by the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A session moved along an edge of the state machine
    SessionStateChanged {
        user_id: UserId,
        from: SessionState,
        to: SessionState,
        reason: Option<StopReason>,
    },

    /// A provider call failed for a user
    ProviderFailed {
        user_id: UserId,
        operation: &'static str,
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

    /// Inactivity sweep completed
    ReaperSwept { summary: SweepSummary },

    /// Stuck `Stopping` sessions were reconciled
    StoppingReconciled { summary: SweepSummary },

    /// Daily shutdown fired
    DailyShutdownFired {
        summary: SweepSummary,
        next_fire: DateTime<Utc>,
    },
}

impl CoreEvent {
    /// Wire form for subscribed clients
    pub fn to_payload(&self) -> EventPayload {
        match self.clone() {
            CoreEvent::SessionStateChanged {
                user_id,
                from,
                to,
                reason,
            } => EventPayload::SessionStateChanged {
                user_id,
                from,
                to,
                reason,
            },
            CoreEvent::ProviderFailed {
                user_id,
                operation,
                transient,
                message,
            } => EventPayload::ProviderFailed {
                user_id,
                operation: operation.to_string(),
                transient,
                message,
            },
            CoreEvent::InstanceAssigned { user_id, instance } => {
                EventPayload::InstanceAssigned { user_id, instance }
            }
            CoreEvent::InstanceReleased { user_id, instance } => {
                EventPayload::InstanceReleased { user_id, instance }
            }
            CoreEvent::ReaperSwept { summary } => EventPayload::ReaperSwept { summary },
            CoreEvent::StoppingReconciled { summary } => {
                EventPayload::StoppingReconciled { summary }
            }
            CoreEvent::DailyShutdownFired { summary, next_fire } => {
                EventPayload::DailyShutdownFired { summary, next_fire }
            }
        }
    }
}
