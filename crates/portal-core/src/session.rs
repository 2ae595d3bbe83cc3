//! Per-user serialization slots and staleness rules

use chrono::{DateTime, Utc};
use portal_store::SessionRecord;
use portal_util::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Mutable part of a slot, guarded by the state lock
#[derive(Debug, Default)]
pub struct SlotState {
    /// Bumped on every transition. A finalisation that observed an older
    /// epoch must not apply.
    pub epoch: u64,
}

/// Serialization primitives for one user.
///
/// `state` is held only while reading, validating and writing the session
/// record, never across a provider call. `gate` orders provider calls for
/// the user so a stop issued during an in-flight start reaches the
/// provider after it.
#[derive(Debug, Default)]
pub struct UserSlot {
    pub state: tokio::sync::Mutex<SlotState>,
    pub gate: tokio::sync::Mutex<()>,
}

/// Lazily populated map of user slots
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: Mutex<HashMap<UserId, Arc<UserSlot>>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for `user`, created on first use
    pub fn get(&self, user: &UserId) -> Arc<UserSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(user.clone()).or_default().clone()
    }
}

/// Time since the last sign of life: the heartbeat, else the last
/// transition. `None` if neither was ever recorded.
pub fn idle_for(session: &SessionRecord, now: DateTime<Utc>) -> Option<chrono::Duration> {
    session
        .last_heartbeat
        .or(session.last_transition)
        .map(|seen| now - seen)
}

/// Whether an `Active` session has outlived `timeout` without a heartbeat.
/// Exactly `timeout` is still fresh.
pub fn is_stale(session: &SessionRecord, timeout: Duration, now: DateTime<Utc>) -> bool {
    match idle_for(session, now) {
        Some(idle) => idle > portal_util::to_chrono(timeout),
        None => true,
    }
}

/// Whether a `Stopping` session has sat there longer than `grace`
pub fn is_stuck_stopping(session: &SessionRecord, grace: Duration, now: DateTime<Utc>) -> bool {
    match session.last_transition {
        Some(at) => now - at > portal_util::to_chrono(grace),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use portal_api::SessionState;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    #[test]
    fn staleness_boundary() {
        let timeout = Duration::from_secs(180 * 60);
        let session = SessionRecord {
            state: SessionState::Active,
            last_heartbeat: Some(at(150)),
            last_transition: Some(at(0)),
        };

        assert!(!is_stale(&session, timeout, at(300)));
        assert!(!is_stale(&session, timeout, at(330)));
        assert!(is_stale(&session, timeout, at(331)));
    }

    #[test]
    fn staleness_falls_back_to_transition() {
        let timeout = Duration::from_secs(60);
        let session = SessionRecord {
            state: SessionState::Active,
            last_heartbeat: None,
            last_transition: Some(at(0)),
        };
        assert!(!is_stale(&session, timeout, at(1)));
        assert!(is_stale(&session, timeout, at(2)));

        assert!(is_stale(&SessionRecord::default(), timeout, at(0)));
    }

    #[test]
    fn stuck_stopping_grace() {
        let grace = Duration::from_secs(600);
        let session = SessionRecord {
            state: SessionState::Stopping,
            last_heartbeat: None,
            last_transition: Some(at(0)),
        };
        assert!(!is_stuck_stopping(&session, grace, at(10)));
        assert!(is_stuck_stopping(&session, grace, at(11)));
    }

    #[test]
    fn slots_are_shared_per_user() {
        let table = SlotTable::new();
        let a = table.get(&UserId::new("alice"));
        let b = table.get(&UserId::new("alice"));
        assert!(Arc::ptr_eq(&a, &b));

        let bob = table.get(&UserId::new("bob"));
        assert!(!Arc::ptr_eq(&a, &bob));
    }
}
