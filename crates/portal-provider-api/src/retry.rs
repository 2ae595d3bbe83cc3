//! Timeout and bounded retry around any provider

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{InstanceRef, InstanceStatus, ProviderAction, ProviderAdapter, ProviderError, ProviderResult};

/// Per-call timeout and retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Bound on each individual attempt
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based), doubling and capped
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.backoff_initial
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 2,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
        }
    }
}

/// Wraps an adapter with a timeout on every attempt and retries for
/// transient failures. Permanent failures return immediately.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: ProviderAdapter> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call<T, F, Fut>(&self, op: &'static str, instance: &InstanceRef, f: F) -> ProviderResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = ProviderResult<T>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.policy.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.policy.timeout)),
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, instance = %instance, attempt, "Provider call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                debug!(op, instance = %instance, error = %err, "Permanent provider failure");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(op, instance = %instance, attempts = attempt, error = %err, "Provider retries exhausted");
                return Err(ProviderError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.backoff_for(attempt - 1);
            warn!(
                op,
                instance = %instance,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient provider failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<P: ProviderAdapter> ProviderAdapter for RetryingProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction> {
        self.call("start", instance, || self.inner.start(instance)).await
    }

    async fn stop(&self, instance: &InstanceRef) -> ProviderResult<ProviderAction> {
        self.call("stop", instance, || self.inner.stop(instance)).await
    }

    async fn query(&self, instance: &InstanceRef) -> ProviderResult<InstanceStatus> {
        self.call("query", instance, || self.inner.query(instance)).await
    }

    fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }
}
