//! Inactivity reaper and stuck-`Stopping` reconciliation

use chrono::{DateTime, Utc};
use portal_api::{SessionState, StopReason, SweepSummary};
use portal_store::AuditEventType;
use portal_util::UserId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::{CoreEvent, SessionController, is_stale, is_stuck_stopping};

/// Result of one reaper cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperCycle {
    pub inactive: SweepSummary,
    pub reconciled: SweepSummary,
}

/// Periodic sweep that stops sessions whose heartbeat went stale
pub struct Reaper {
    controller: Arc<SessionController>,
    running: AtomicBool,
}

/// Clears the in-progress flag when a cycle ends, even on panic
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reaper {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self {
            controller,
            running: AtomicBool::new(false),
        }
    }

    /// Run one cycle. Returns `None` when another cycle is still running.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Option<ReaperCycle> {
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("Reaper cycle still in progress, skipping");
            return None;
        }
        let _guard = CycleGuard(&self.running);

        let inactive = self.sweep_inactive(now).await;
        let reconciled = self.reconcile_stopping(now).await;
        Some(ReaperCycle {
            inactive,
            reconciled,
        })
    }

    /// Users recorded `Active` whose heartbeat is older than the timeout
    pub fn stale_users(&self, now: DateTime<Utc>) -> Vec<UserId> {
        let timeout = self.controller.settings().inactivity_timeout;
        match self.controller.store().users_in_state(SessionState::Active) {
            Ok(users) => users
                .into_iter()
                .filter(|u| is_stale(&u.session, timeout, now))
                .map(|u| u.id)
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to list active users");
                Vec::new()
            }
        }
    }

    /// Users recorded `Stopping` for longer than the grace period
    pub fn stuck_users(&self, now: DateTime<Utc>) -> Vec<UserId> {
        let grace = self.controller.settings().stuck_stopping_grace;
        match self.controller.store().users_in_state(SessionState::Stopping) {
            Ok(users) => users
                .into_iter()
                .filter(|u| is_stuck_stopping(&u.session, grace, now))
                .map(|u| u.id)
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to list stopping users");
                Vec::new()
            }
        }
    }

    pub async fn sweep_inactive(&self, now: DateTime<Utc>) -> SweepSummary {
        let users = self.stale_users(now);
        if users.is_empty() {
            return SweepSummary::default();
        }

        let summary = self
            .controller
            .stop_many(users, StopReason::Inactivity, now)
            .await;

        info!(
            considered = summary.considered,
            stopped = summary.stopped,
            skipped = summary.skipped,
            failed = summary.failed,
            "Inactivity sweep finished"
        );
        self.controller
            .audit(AuditEventType::ReaperSweep { summary });
        self.controller.emit(CoreEvent::ReaperSwept { summary });
        summary
    }

    pub async fn reconcile_stopping(&self, now: DateTime<Utc>) -> SweepSummary {
        let users = self.stuck_users(now);
        if users.is_empty() {
            return SweepSummary::default();
        }

        let summary = self
            .controller
            .stop_many(users, StopReason::Reconcile, now)
            .await;

        info!(
            considered = summary.considered,
            stopped = summary.stopped,
            failed = summary.failed,
            "Stuck stops reconciled"
        );
        self.controller
            .audit(AuditEventType::ReconcileSweep { summary });
        self.controller
            .emit(CoreEvent::StoppingReconciled { summary });
        summary
    }

    /// Run a cycle every `interval` until `shutdown` flips to true.
    /// Late ticks are skipped, never queued.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            info!(interval_secs = interval.as_secs(), "Inactivity reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle(portal_util::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Inactivity reaper stopped");
        })
    }
}
