//! Daily shutdown scheduler

use chrono::{DateTime, Utc};
use portal_api::{ScheduleView, StopReason, SweepSummary};
use portal_config::ShutdownConfig;
use portal_store::AuditEventType;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{CoreEvent, SessionController};

/// Longest single sleep. The clock is re-read after every nap, so a wall
/// clock jump is noticed within this bound.
pub const MAX_NAP: Duration = Duration::from_secs(60);

/// When the shutdown fires next and when it last fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fired: Option<DateTime<Utc>>,
}

/// Stops every assigned instance once a day at a fixed wall-clock time,
/// whatever the recorded session state.
pub struct DailyShutdown {
    controller: Arc<SessionController>,
    config: ShutdownConfig,
    state: Mutex<ScheduleState>,
}

impl DailyShutdown {
    /// Computes the first firing from `now`
    pub fn new(controller: Arc<SessionController>, config: ShutdownConfig, now: DateTime<Utc>) -> Self {
        let next_fire = config.enabled.then(|| config.schedule.next_after(now));
        if let Some(next) = next_fire {
            info!(schedule = %config.schedule, next_fire = %next, "Daily shutdown scheduled");
        } else {
            info!("Daily shutdown disabled");
        }

        Self {
            controller,
            config,
            state: Mutex::new(ScheduleState {
                next_fire,
                last_fired: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ScheduleState {
        *self.lock()
    }

    pub fn view(&self) -> ScheduleView {
        let state = self.state();
        ScheduleView {
            enabled: self.config.enabled,
            at: self.config.schedule.at.to_string(),
            utc_offset: self.config.schedule.offset.to_string(),
            next_fire: state.next_fire,
            last_fired: state.last_fired,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.lock().next_fire.is_some_and(|next| now >= next)
    }

    /// Issue a daily-shutdown stop for every user holding an instance, then
    /// recompute the next firing from `now`.
    pub async fn fire(&self, now: DateTime<Utc>) -> SweepSummary {
        let users = match self.controller.store().users_with_assignment() {
            Ok(users) => users.into_iter().map(|u| u.id).collect::<Vec<_>>(),
            Err(e) => {
                error!(error = %e, "Failed to list assigned users for daily shutdown");
                Vec::new()
            }
        };

        info!(users = users.len(), "Daily shutdown firing");
        let summary = self
            .controller
            .stop_many(users, StopReason::DailyShutdown, now)
            .await;

        let next_fire = self.config.schedule.next_after(now);
        {
            let mut state = self.lock();
            state.last_fired = Some(now);
            state.next_fire = Some(next_fire);
        }

        info!(
            stopped = summary.stopped,
            skipped = summary.skipped,
            failed = summary.failed,
            next_fire = %next_fire,
            "Daily shutdown finished"
        );
        if summary.failed > 0 {
            warn!(failed = summary.failed, "Some instances could not be stopped");
        }
        self.controller
            .audit(AuditEventType::DailyShutdown { summary });
        self.controller
            .emit(CoreEvent::DailyShutdownFired { summary, next_fire });
        summary
    }

    /// Sleep until the next firing and fire, until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let nap = match self.state().next_fire {
                    Some(next) => {
                        let now = portal_util::now();
                        if now >= next {
                            self.fire(now).await;
                            continue;
                        }
                        (next - now).to_std().unwrap_or(Duration::ZERO).min(MAX_NAP)
                    }
                    // Disabled: only wait for shutdown
                    None => MAX_NAP,
                };

                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Daily shutdown scheduler stopped");
        })
    }

    #[cfg(test)]
    fn set_next_fire(&self, next: Option<DateTime<Utc>>) {
        self.lock().next_fire = next;
    }
}
