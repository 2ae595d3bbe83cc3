//! Mock provider for testing and development

use async_trait::async_trait;
use portal_util::InstanceId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::{
    InstanceRef, InstanceStatus, ProviderAction, ProviderAdapter, ProviderError, ProviderResult,
};

/// Provider operation, for scripting failures and inspecting calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Start,
    Stop,
    Query,
}

/// Scripted failure mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Fails with a 503
    Transient,
    /// Fails with an API rejection
    Permanent,
    /// Never answers
    Hang,
}

/// A recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub uuid: InstanceId,
}

#[derive(Debug, Clone)]
struct MockInstance {
    running: bool,
    url: Option<String>,
}

/// In-memory provider with scripted failures and a call log
pub struct MockProvider {
    instances: Mutex<HashMap<InstanceId, MockInstance>>,
    failures: Mutex<HashMap<MockOp, VecDeque<MockFailure>>>,
    calls: Mutex<Vec<MockCall>>,
    latency: Mutex<Option<Duration>>,
    /// When set, accepted starts leave the instance booting until `finish_boot`
    hold_boot: AtomicBool,
    healthy: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            hold_boot: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    /// Register an instance the provider knows about
    pub fn add_instance(&self, instance: &InstanceRef, running: bool) {
        lock(&self.instances).insert(
            instance.uuid.clone(),
            MockInstance {
                running,
                url: Some(format!("https://mock.invalid/lab/{}", instance.provider_id)),
            },
        );
    }

    pub fn set_running(&self, uuid: &InstanceId, running: bool) {
        if let Some(instance) = lock(&self.instances).get_mut(uuid) {
            instance.running = running;
        }
    }

    pub fn is_running(&self, uuid: &InstanceId) -> bool {
        lock(&self.instances)
            .get(uuid)
            .map(|i| i.running)
            .unwrap_or(false)
    }

    /// Make the next `times` calls of `op` fail with `failure`
    pub fn fail_next(&self, op: MockOp, failure: MockFailure, times: usize) {
        let mut failures = lock(&self.failures);
        let queue = failures.entry(op).or_default();
        queue.extend(std::iter::repeat_n(failure, times));
    }

    /// Drop all scripted failures
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Keep started instances booting (query reports not running)
    pub fn set_hold_boot(&self, hold: bool) {
        self.hold_boot.store(hold, Ordering::SeqCst);
    }

    /// Complete the boot of a held instance
    pub fn finish_boot(&self, uuid: &InstanceId) {
        self.set_running(uuid, true);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        lock(&self.calls).iter().filter(|c| c.op == op).count()
    }

    /// Start/stop calls only, in order
    pub fn actions(&self) -> Vec<MockOp> {
        lock(&self.calls)
            .iter()
            .map(|c| c.op)
            .filter(|op| *op != MockOp::Query)
            .collect()
    }

    async fn enter(&self, op: MockOp, instance: &InstanceRef) -> ProviderResult<()> {
        lock(&self.calls).push(MockCall {
            op,
            uuid: instance.uuid.clone(),
        });

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = lock(&self.failures)
            .get_mut(&op)
            .and_then(|q| q.pop_front());
        match failure {
            None => Ok(()),
            Some(MockFailure::Transient) => Err(ProviderError::Http {
                status: 503,
                message: "mock transient failure".into(),
            }),
            Some(MockFailure::Permanent) => {
                Err(ProviderError::Rejected("mock permanent failure".into()))
            }
            Some(MockFailure::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction> {
        self.enter(MockOp::Start, instance).await?;

        let hold = self.hold_boot.load(Ordering::SeqCst);
        let mut instances = lock(&self.instances);
        let entry = instances
            .get_mut(&instance.uuid)
            .ok_or_else(|| ProviderError::UnknownInstance(instance.uuid.clone()))?;

        if entry.running {
            debug!(instance = %instance, "Mock start skipped, already running");
            return Ok(ProviderAction::Skipped);
        }
        if !hold {
            entry.running = true;
        }
        Ok(ProviderAction::Issued)
    }

    async fn stop(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction> {
        self.enter(MockOp::Stop, instance).await?;

        let mut instances = lock(&self.instances);
        let entry = instances
            .get_mut(&instance.uuid)
            .ok_or_else(|| ProviderError::UnknownInstance(instance.uuid.clone()))?;

        if !entry.running {
            debug!(instance = %instance, "Mock stop skipped, already stopped");
            return Ok(ProviderAction::Skipped);
        }
        entry.running = false;
        Ok(ProviderAction::Issued)
    }

    async fn query(&self, instance: &InstanceRef) -> ProviderResult<InstanceStatus> {
        self.enter(MockOp::Query, instance).await?;

        let instances = lock(&self.instances);
        let entry = instances
            .get(&instance.uuid)
            .ok_or_else(|| ProviderError::UnknownInstance(instance.uuid.clone()))?;

        Ok(if entry.running {
            InstanceStatus::running(entry.url.clone())
        } else {
            InstanceStatus::stopped()
        })
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceRef {
        InstanceRef::new("inst-a", 1)
    }

    #[tokio::test]
    async fn mock_start_and_stop() {
        let provider = MockProvider::new();
        provider.add_instance(&instance(), false);

        assert_eq!(provider.start(&instance()).await.unwrap(), ProviderAction::Issued);
        assert!(provider.query(&instance()).await.unwrap().running);
        assert_eq!(provider.start(&instance()).await.unwrap(), ProviderAction::Skipped);

        assert_eq!(provider.stop(&instance()).await.unwrap(), ProviderAction::Issued);
        assert_eq!(provider.stop(&instance()).await.unwrap(), ProviderAction::Skipped);
        assert!(!provider.is_running(&instance().uuid));

        assert_eq!(
            provider.actions(),
            vec![MockOp::Start, MockOp::Start, MockOp::Stop, MockOp::Stop]
        );
    }

    #[tokio::test]
    async fn unknown_instance_is_permanent() {
        let provider = MockProvider::new();
        let err = provider.start(&instance()).await.unwrap_err();
        assert!(matches!(err, ProviderError::UnknownInstance(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let provider = MockProvider::new();
        provider.add_instance(&instance(), false);
        provider.fail_next(MockOp::Start, MockFailure::Transient, 1);

        let err = provider.start(&instance()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(provider.start(&instance()).await.is_ok());
    }

    #[tokio::test]
    async fn held_boot_reports_not_running() {
        let provider = MockProvider::new();
        provider.add_instance(&instance(), false);
        provider.set_hold_boot(true);

        provider.start(&instance()).await.unwrap();
        assert!(!provider.query(&instance()).await.unwrap().running);

        provider.finish_boot(&instance().uuid);
        let status = provider.query(&instance()).await.unwrap();
        assert!(status.running);
        assert!(status.url.is_some());
    }
}
