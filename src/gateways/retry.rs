//! Resilient Gateway Wrapper
//!
//! Wraps every upstream call with bounded retries on an exponential
//! schedule, a per-attempt timeout and cooperative cancellation. Only
//! transient failures are retried; permission, not-found and malformed-data
//! errors surface on the first attempt.

use crate::config::RetryConfig;
use crate::domain::ports::{
    BackendEntity, BackendGateway, ClusterGateway, DriverHealth, PoolInfo, ResourceIdentity,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Retry Policy
// =============================================================================

/// Attempt budget and backoff schedule for upstream calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Jitter applied to each delay, 0.0 disables it
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: config.attempt_timeout,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
            randomization_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_backoff)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `op` until it succeeds, fails permanently, exhausts the attempt
    /// budget, or `cancel` fires.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut schedule = self.schedule();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(operation));
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(operation)),
                res = tokio::time::timeout(self.attempt_timeout, op()) => res,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Upstream call succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => Error::Timeout {
                    operation: operation.to_string(),
                    after: self.attempt_timeout,
                },
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(operation, attempts = attempt, error = %err, "Retries exhausted");
                return Err(err);
            }

            let delay = schedule.next_backoff().unwrap_or(self.max_backoff);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(operation)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn cancelled(operation: &str) -> Error {
    Error::Cancelled {
        operation: operation.to_string(),
    }
}

// =============================================================================
// Resilient Gateway
// =============================================================================

/// Decorates a gateway so every call goes through a [`RetryPolicy`]
pub struct Resilient<G: ?Sized> {
    inner: Arc<G>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<G: ?Sized> Resilient<G> {
    pub fn new(inner: Arc<G>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<G: ClusterGateway + ?Sized> ClusterGateway for Resilient<G> {
    async fn list_volumes(&self) -> Result<Vec<ResourceIdentity>> {
        self.policy
            .execute("kubernetes.list_volumes", &self.cancel, || self.inner.list_volumes())
            .await
    }

    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<ResourceIdentity>> {
        self.policy
            .execute("kubernetes.list_claims", &self.cancel, || {
                self.inner.list_claims(namespace)
            })
            .await
    }

    async fn list_snapshots(&self, namespace: Option<&str>) -> Result<Vec<ResourceIdentity>> {
        self.policy
            .execute("kubernetes.list_snapshots", &self.cancel, || {
                self.inner.list_snapshots(namespace)
            })
            .await
    }

    async fn driver_health(&self) -> Result<DriverHealth> {
        self.policy
            .execute("kubernetes.driver_health", &self.cancel, || self.inner.driver_health())
            .await
    }

    async fn test_connection(&self) -> Result<()> {
        self.policy
            .execute("kubernetes.test_connection", &self.cancel, || {
                self.inner.test_connection()
            })
            .await
    }

    fn system(&self) -> &str {
        self.inner.system()
    }
}

#[async_trait]
impl<G: BackendGateway + ?Sized> BackendGateway for Resilient<G> {
    async fn list_volumes(&self) -> Result<Vec<BackendEntity>> {
        self.policy
            .execute("truenas.list_volumes", &self.cancel, || self.inner.list_volumes())
            .await
    }

    async fn list_snapshots(&self) -> Result<Vec<BackendEntity>> {
        self.policy
            .execute("truenas.list_snapshots", &self.cancel, || self.inner.list_snapshots())
            .await
    }

    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        self.policy
            .execute("truenas.list_pools", &self.cancel, || self.inner.list_pools())
            .await
    }

    async fn test_connection(&self) -> Result<()> {
        self.policy
            .execute("truenas.test_connection", &self.cancel, || {
                self.inner.test_connection()
            })
            .await
    }

    fn system(&self) -> &str {
        self.inner.system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::memory::{FailureMode, InMemoryBackend};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            multiplier: 2.0,
            randomization_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let value = fast_policy()
            .execute("op", &cancel, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::BackendApi {
                        status: 503,
                        message: "busy".into(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let err = fast_policy()
            .execute("op", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::BackendApi {
                    status: 502,
                    message: "bad gateway".into(),
                })
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::BackendApi { status: 502, .. });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let err = fast_policy()
            .execute("op", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Unauthorized {
                    system: "truenas".into(),
                    permission: "read datasets".into(),
                })
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::Unauthorized { .. });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let err = fast_policy()
            .execute("op", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::ResourceNotFound {
                    kind: "dataset".into(),
                    name: "tank/x".into(),
                })
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceNotFound { .. });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let mut policy = fast_policy();
        policy.attempt_timeout = Duration::from_millis(10);

        let err = policy
            .execute("slow", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::Timeout { .. });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fast_policy()
            .execute("op", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::Cancelled { .. });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let mut policy = fast_policy();
        policy.initial_backoff = Duration::from_secs(10);
        policy.max_backoff = Duration::from_secs(10);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let counter = calls.clone();
        let err = policy
            .execute("op", &cancel, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::BackendApi {
                        status: 500,
                        message: "oops".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::Cancelled { .. });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resilient_gateway_wraps_backend() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_times("list_pools", FailureMode::Transient, 2);

        let resilient = Resilient::new(backend.clone(), fast_policy(), CancellationToken::new());
        let pools = resilient.list_pools().await.unwrap();
        assert!(pools.is_empty());
        assert_eq!(backend.calls("list_pools"), 3);
        assert_eq!(BackendGateway::system(&resilient), "truenas");
    }
}
