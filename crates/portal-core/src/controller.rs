//! Session state machine

use chrono::{DateTime, Utc};
use portal_api::{
    HeartbeatOutcome, InstanceView, SessionState, StartOutcome, StatusView, StopOutcome,
    StopReason, SweepSummary, UserView,
};
use portal_config::ControllerConfig;
use portal_provider_api::{InstanceRef, ProviderAction, ProviderAdapter, ProviderError, ProviderResult};
use portal_store::{AuditEvent, AuditEventType, SessionRecord, Store};
use portal_util::{InstanceId, PortalError, Result, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{CoreEvent, InstanceRegistry, SlotState, SlotTable, UserSlot, is_stale, is_stuck_stopping};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables of the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub inactivity_timeout: Duration,
    /// Controller-level stop attempts before forcing `Inactive`
    pub stop_attempts: u32,
    pub stop_retry_delay: Duration,
    pub stuck_stopping_grace: Duration,
    pub sweep_concurrency: usize,
    pub max_assignments_per_owner: Option<u32>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            inactivity_timeout: config.inactivity_timeout,
            stop_attempts: config.stop_attempts,
            stop_retry_delay: config.stop_retry_delay,
            stuck_stopping_grace: config.stuck_stopping_grace,
            sweep_concurrency: config.sweep_concurrency,
            max_assignments_per_owner: config.max_assignments_per_owner,
        }
    }
}

/// What a stop does once the state lock is released
enum StopPlan {
    /// Stop the instance, then finalise `Stopping -> Inactive`
    Finalize { instance: InstanceRef, epoch: u64 },
    /// Re-query a stuck `Stopping` session, stop if still running, finalise
    Reconcile { instance: InstanceRef, epoch: u64 },
    /// Stop the instance of an `Inactive` session; no state change
    SendOnly { instance: InstanceRef },
}

/// Reasons that reach the provider even when the session is recorded
/// `Inactive`
fn ignores_recorded_state(reason: StopReason) -> bool {
    matches!(reason, StopReason::DailyShutdown | StopReason::InstanceReleased)
}

/// The per-user session state machine.
///
/// All entry points (user actions, reaper, scheduler) go through here.
/// Transitions for one user are serialised by that user's slot; different
/// users proceed in parallel.
pub struct SessionController {
    registry: InstanceRegistry,
    store: Arc<dyn Store>,
    provider: Arc<dyn ProviderAdapter>,
    settings: ControllerSettings,
    slots: SlotTable,
    events: broadcast::Sender<CoreEvent>,
}

impl SessionController {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ProviderAdapter>,
        settings: ControllerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(
            provider = provider.name(),
            inactivity_timeout_secs = settings.inactivity_timeout.as_secs(),
            stop_attempts = settings.stop_attempts,
            "Session controller initialized"
        );

        Self {
            registry: InstanceRegistry::new(store.clone(), settings.max_assignments_per_owner),
            store,
            provider,
            settings,
            slots: SlotTable::new(),
            events,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn ProviderAdapter> {
        &self.provider
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }

    // Queries

    pub fn get_user(&self, user: &UserId) -> Result<UserView> {
        Ok(self.registry.user(user)?.to_view())
    }

    pub fn list_users(&self) -> Result<Vec<UserView>> {
        Ok(self
            .store
            .list_users()?
            .iter()
            .map(|u| u.to_view())
            .collect())
    }

    pub fn lookup(&self, user: &UserId) -> Result<Option<InstanceView>> {
        Ok(self.registry.lookup(user)?.map(|i| i.to_view()))
    }

    // Transitions

    /// Move along one edge of the state machine and record it. Must be
    /// called with the user's state lock held.
    fn transition(
        &self,
        user: &UserId,
        session: &mut SessionRecord,
        slot: &mut SlotState,
        to: SessionState,
        reason: Option<StopReason>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let from = session.state;
        if !from.can_transition_to(to) {
            return Err(PortalError::internal(format!(
                "illegal session transition {from} -> {to} for {user}"
            )));
        }

        session.transition(to, now);
        if to == SessionState::Active {
            session.last_heartbeat = Some(now);
        }
        self.store.save_session(user, session)?;
        slot.epoch += 1;

        info!(user_id = %user, %from, %to, reason = ?reason, "Session transition");
        self.audit(AuditEventType::SessionTransition {
            user_id: user.clone(),
            from,
            to,
            reason,
        });
        self.emit(CoreEvent::SessionStateChanged {
            user_id: user.clone(),
            from,
            to,
            reason,
        });
        Ok(())
    }

    fn provider_failed(&self, user: &UserId, operation: &'static str, err: &ProviderError) {
        warn!(
            user_id = %user,
            operation,
            transient = err.is_transient(),
            error = %err,
            "Provider call failed"
        );
        self.audit(AuditEventType::ProviderFailure {
            user_id: user.clone(),
            operation: operation.to_string(),
            transient: err.is_transient(),
            message: err.to_string(),
        });
        self.emit(CoreEvent::ProviderFailed {
            user_id: user.clone(),
            operation,
            transient: err.is_transient(),
            message: err.to_string(),
        });
    }

    /// `Inactive -> Starting`, then ask the provider to start.
    ///
    /// Permanent provider failures, exhausted adapter retries included,
    /// revert to `Inactive`; transient ones leave the session `Starting`.
    /// Both are returned to the caller.
    pub async fn request_start(&self, user: &UserId, now: DateTime<Utc>) -> Result<StartOutcome> {
        let slot = self.slots.get(user);

        let (instance, epoch) = {
            let mut guard = slot.state.lock().await;
            let mut record = self.registry.user(user)?;
            if record.session.state != SessionState::Inactive {
                debug!(user_id = %user, state = %record.session.state, "Start ignored, session not inactive");
                return Ok(StartOutcome::AlreadyInState {
                    state: record.session.state,
                });
            }

            let (_, instance) = self.registry.instance_ref(user)?;
            self.transition(
                user,
                &mut record.session,
                &mut guard,
                SessionState::Starting,
                None,
                now,
            )?;
            (instance, guard.epoch)
        };

        let _gate = slot.gate.lock().await;

        // A stop may have won the race to the gate
        {
            let guard = slot.state.lock().await;
            if guard.epoch != epoch {
                let state = self.registry.user(user)?.session.state;
                debug!(user_id = %user, %state, "Start superseded before reaching the provider");
                return Ok(StartOutcome::AlreadyInState { state });
            }
        }

        match self.provider.start(&instance).await {
            Ok(action) => {
                info!(user_id = %user, instance = %instance, ?action, "Start accepted by provider");
                Ok(StartOutcome::Starting)
            }
            Err(err) => {
                self.provider_failed(user, "start", &err);
                if !err.is_transient() {
                    self.revert_start(&slot, user, epoch, now).await?;
                }
                Err(err.into())
            }
        }
    }

    async fn revert_start(
        &self,
        slot: &UserSlot,
        user: &UserId,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut guard = slot.state.lock().await;
        let mut record = self.registry.user(user)?;
        if guard.epoch == epoch && record.session.state == SessionState::Starting {
            self.transition(
                user,
                &mut record.session,
                &mut guard,
                SessionState::Inactive,
                None,
                now,
            )?;
        }
        Ok(())
    }

    /// Ask the provider about the user's instance. Promotes
    /// `Starting -> Active` once the provider reports it running.
    pub async fn poll_status(&self, user: &UserId, now: DateTime<Utc>) -> Result<StatusView> {
        let slot = self.slots.get(user);

        let (instance, instance_ref) = {
            let _guard = slot.state.lock().await;
            self.registry.user(user)?;
            self.registry.instance_ref(user)?
        };

        let status = match self.provider.query(&instance_ref).await {
            Ok(status) => status,
            Err(err) => {
                self.provider_failed(user, "query", &err);
                return Err(err.into());
            }
        };

        let state = {
            let mut guard = slot.state.lock().await;
            let mut record = self.registry.user(user)?;
            if status.running && record.session.state == SessionState::Starting {
                self.transition(
                    user,
                    &mut record.session,
                    &mut guard,
                    SessionState::Active,
                    None,
                    now,
                )?;
            }
            record.session.state
        };

        let target_url = if instance.target_url.is_empty() {
            status.url.clone().unwrap_or_default()
        } else {
            instance.target_url
        };

        Ok(StatusView {
            is_running: status.running,
            target_url,
            provider_status: status.status_code,
            provider_url: status.url,
            state,
        })
    }

    /// Stamp the heartbeat of an `Active` session. Any other state is a
    /// no-op. Never touches the provider.
    pub async fn record_heartbeat(
        &self,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome> {
        let slot = self.slots.get(user);
        let _guard = slot.state.lock().await;

        let mut record = self.registry.user(user)?;
        if record.session.state != SessionState::Active {
            debug!(user_id = %user, state = %record.session.state, "Heartbeat ignored");
            return Ok(HeartbeatOutcome::Ignored {
                state: record.session.state,
            });
        }

        record.session.last_heartbeat = Some(now);
        self.store.save_session(user, &record.session)?;
        Ok(HeartbeatOutcome::Recorded { at: now })
    }

    /// `{Starting, Active} -> Stopping -> Inactive`.
    ///
    /// Stopping an `Inactive` or `Stopping` session is a no-op, except that
    /// daily shutdown and release still send a provider stop for an
    /// `Inactive` session, and a reconcile finalises a stuck `Stopping` one.
    pub async fn request_stop(
        &self,
        user: &UserId,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> Result<StopOutcome> {
        let slot = self.slots.get(user);

        let plan = {
            let mut guard = slot.state.lock().await;
            let mut record = self.registry.user(user)?;
            let instance = self
                .store
                .instance_for_user(user)?
                .map(|i| InstanceRef::new(i.uuid, i.provider_id));
            let state = record.session.state;

            match state {
                SessionState::Inactive => match instance {
                    Some(instance) if ignores_recorded_state(reason) => {
                        StopPlan::SendOnly { instance }
                    }
                    _ => {
                        debug!(user_id = %user, %reason, "Stop ignored, session inactive");
                        return Ok(StopOutcome::AlreadyInState { state });
                    }
                },
                SessionState::Stopping => {
                    if reason != StopReason::Reconcile
                        || !is_stuck_stopping(&record.session, self.settings.stuck_stopping_grace, now)
                    {
                        debug!(user_id = %user, %reason, "Stop ignored, already stopping");
                        return Ok(StopOutcome::AlreadyInState { state });
                    }
                    match instance {
                        Some(instance) => StopPlan::Reconcile {
                            instance,
                            epoch: guard.epoch,
                        },
                        None => {
                            self.transition(
                                user,
                                &mut record.session,
                                &mut guard,
                                SessionState::Inactive,
                                Some(reason),
                                now,
                            )?;
                            return Ok(StopOutcome::Stopped { attempts: 0 });
                        }
                    }
                }
                SessionState::Starting if reason == StopReason::Inactivity => {
                    debug!(user_id = %user, "Inactivity stop ignored, session still starting");
                    return Ok(StopOutcome::AlreadyInState { state });
                }
                SessionState::Active
                    if reason == StopReason::Inactivity
                        && !is_stale(&record.session, self.settings.inactivity_timeout, now) =>
                {
                    debug!(user_id = %user, "Inactivity stop dropped, heartbeat is fresh");
                    return Ok(StopOutcome::StillFresh);
                }
                SessionState::Starting | SessionState::Active => {
                    self.transition(
                        user,
                        &mut record.session,
                        &mut guard,
                        SessionState::Stopping,
                        Some(reason),
                        now,
                    )?;
                    match instance {
                        Some(instance) => StopPlan::Finalize {
                            instance,
                            epoch: guard.epoch,
                        },
                        None => {
                            self.transition(
                                user,
                                &mut record.session,
                                &mut guard,
                                SessionState::Inactive,
                                Some(reason),
                                now,
                            )?;
                            return Ok(StopOutcome::Stopped { attempts: 0 });
                        }
                    }
                }
            }
        };

        let _gate = slot.gate.lock().await;

        match plan {
            StopPlan::SendOnly { instance } => {
                let (attempts, result) = self.stop_with_attempts(user, &instance).await;
                match result {
                    Ok(action) => {
                        info!(user_id = %user, %reason, ?action, attempts, "Stop sent for inactive session");
                        Ok(StopOutcome::StopSent)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            StopPlan::Finalize { instance, epoch } => {
                let (attempts, result) = self.stop_with_attempts(user, &instance).await;
                self.finish_stop(&slot, user, epoch, reason, attempts, result, now)
                    .await
            }
            StopPlan::Reconcile { instance, epoch } => {
                match self.provider.query(&instance).await {
                    Ok(status) if !status.running => {
                        info!(user_id = %user, "Stuck stop confirmed by provider");
                        self.finish_stop(&slot, user, epoch, reason, 0, Ok(ProviderAction::Skipped), now)
                            .await
                    }
                    other => {
                        if let Err(err) = &other {
                            self.provider_failed(user, "query", err);
                        }
                        let (attempts, result) = self.stop_with_attempts(user, &instance).await;
                        self.finish_stop(&slot, user, epoch, reason, attempts, result, now)
                            .await
                    }
                }
            }
        }
    }

    /// Call the provider's stop up to `stop_attempts` times. Permanent
    /// errors end the loop early. An instance the provider does not list
    /// counts as stopped.
    async fn stop_with_attempts(
        &self,
        user: &UserId,
        instance: &InstanceRef,
    ) -> (u32, ProviderResult<ProviderAction>) {
        let max_attempts = self.settings.stop_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.provider.stop(instance).await {
                Ok(action) => return (attempt, Ok(action)),
                Err(err @ ProviderError::UnknownInstance(_)) => {
                    self.provider_failed(user, "stop", &err);
                    warn!(user_id = %user, instance = %instance, "Provider no longer lists the instance, nothing to stop");
                    return (attempt, Ok(ProviderAction::Skipped));
                }
                Err(err) => {
                    self.provider_failed(user, "stop", &err);
                    if !err.is_transient() || attempt >= max_attempts {
                        return (attempt, Err(err));
                    }
                    warn!(user_id = %user, attempt, max_attempts, "Stop failed, retrying");
                    tokio::time::sleep(self.settings.stop_retry_delay).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_stop(
        &self,
        slot: &UserSlot,
        user: &UserId,
        epoch: u64,
        reason: StopReason,
        attempts: u32,
        result: ProviderResult<ProviderAction>,
        now: DateTime<Utc>,
    ) -> Result<StopOutcome> {
        let mut guard = slot.state.lock().await;
        let mut record = self.registry.user(user)?;

        if guard.epoch != epoch || record.session.state != SessionState::Stopping {
            debug!(user_id = %user, state = %record.session.state, "Stop already finalised elsewhere");
            return Ok(StopOutcome::AlreadyInState {
                state: record.session.state,
            });
        }

        self.transition(
            user,
            &mut record.session,
            &mut guard,
            SessionState::Inactive,
            Some(reason),
            now,
        )?;

        match result {
            Ok(_) => Ok(StopOutcome::Stopped { attempts }),
            Err(err) => {
                error!(
                    user_id = %user,
                    attempts,
                    error = %err,
                    "Provider never confirmed stop, session forced inactive"
                );
                self.audit(AuditEventType::StopForced {
                    user_id: user.clone(),
                    attempts,
                    error: err.to_string(),
                });
                Ok(StopOutcome::ForcedInactive {
                    attempts,
                    error: err.to_string(),
                })
            }
        }
    }

    // Registry operations that touch sessions

    /// Assign an instance to a user, under the user's state lock
    pub async fn assign(&self, user: &UserId, instance: &InstanceId) -> Result<InstanceView> {
        let slot = self.slots.get(user);
        let _guard = slot.state.lock().await;

        let view = self.registry.assign(user, instance)?;
        self.emit(CoreEvent::InstanceAssigned {
            user_id: user.clone(),
            instance: instance.clone(),
        });
        Ok(view)
    }

    /// Stop the user's instance, then clear the assignment.
    ///
    /// Refused with `InstanceBusy` when the provider cannot confirm the
    /// stop, so a released instance is never left running. An instance the
    /// provider no longer lists is released.
    pub async fn release(
        &self,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(Option<InstanceId>, StopOutcome)> {
        let outcome = match self.request_stop(user, StopReason::InstanceReleased, now).await {
            Ok(outcome) => outcome,
            Err(PortalError::ProviderError { message, .. }) => {
                return Err(PortalError::busy(format!(
                    "could not stop instance of {user}: {message}"
                )));
            }
            Err(e) => return Err(e),
        };

        if let StopOutcome::ForcedInactive { error, .. } = &outcome {
            return Err(PortalError::busy(format!(
                "provider did not confirm stop for {user}: {error}"
            )));
        }

        let slot = self.slots.get(user);
        let _guard = slot.state.lock().await;

        let state = self.registry.user(user)?.session.state;
        if state != SessionState::Inactive {
            return Err(PortalError::busy(format!("session of {user} is {state}")));
        }

        let released = self.registry.release(user)?;
        if let Some(instance) = &released {
            self.emit(CoreEvent::InstanceReleased {
                user_id: user.clone(),
                instance: instance.clone(),
            });
        }
        Ok((released, outcome))
    }

    // Sweeps

    /// Stop every user in `users` for `reason`, at most `sweep_concurrency`
    /// at a time. A failure for one user never aborts the others.
    pub async fn stop_many(
        self: &Arc<Self>,
        users: Vec<UserId>,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> SweepSummary {
        let mut summary = SweepSummary {
            considered: users.len(),
            ..SweepSummary::default()
        };
        if users.is_empty() {
            return summary;
        }

        let permits = Arc::new(Semaphore::new(self.settings.sweep_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for user in users {
            let controller = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = controller.request_stop(&user, reason, now).await;
                (user, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) if outcome.did_stop() => summary.stopped += 1,
                Ok((_, Ok(_))) => summary.skipped += 1,
                Ok((user, Err(e))) => {
                    warn!(user_id = %user, %reason, error = %e, "Stop failed during sweep");
                    summary.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Sweep task failed");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}
