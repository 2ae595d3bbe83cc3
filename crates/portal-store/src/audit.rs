//! Audit event types

use chrono::{DateTime, Utc};
use portal_api::{SessionState, StopReason, SweepSummary};
use portal_util::{InstanceId, UserId};
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Config loaded and seeded into the store
    ConfigLoaded { users: usize, instances: usize },

    /// Session moved along an edge of the state machine
    SessionTransition {
        user_id: UserId,
        from: SessionState,
        to: SessionState,
        reason: Option<StopReason>,
    },

    /// Stop retries ran out and the session was finalised anyway
    StopForced {
        user_id: UserId,
        attempts: u32,
        error: String,
    },

    /// A provider call failed
    ProviderFailure {
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

    ReaperSweep { summary: SweepSummary },

    ReconcileSweep { summary: SweepSummary },

    DailyShutdown { summary: SweepSummary },

    /// Client connected
    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    /// Client disconnected
    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: portal_util::now(),
            event,
        }
    }

    pub fn at(event: AuditEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            timestamp,
            event,
        }
    }
}
