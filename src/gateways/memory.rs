//! In-memory gateways
//!
//! Fake cluster and backend used by tests and local experiments. Contents
//! are set directly; faults and latency can be injected per operation and
//! every call is counted.

use crate::domain::ports::{
    BackendEntity, BackendGateway, ClusterGateway, DriverHealth, PoolInfo, ResourceIdentity,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// Fault Injection
// =============================================================================

/// Failure returned by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Upstream 503
    Transient,
    /// Upstream 403
    Unauthorized,
    /// Upstream 404
    NotFound,
    /// Unparseable response
    Malformed,
}

impl FailureMode {
    fn to_error(self, system: &str, operation: &str) -> Error {
        match self {
            FailureMode::Transient => Error::BackendApi {
                status: 503,
                message: format!("{} unavailable during {}", system, operation),
            },
            FailureMode::Unauthorized => Error::Unauthorized {
                system: system.to_string(),
                permission: operation.to_string(),
            },
            FailureMode::NotFound => Error::ResourceNotFound {
                kind: system.to_string(),
                name: operation.to_string(),
            },
            FailureMode::Malformed => {
                Error::BackendResponseParse(format!("garbled {} response", operation))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    mode: FailureMode,
    /// Remaining failures, `None` fails forever
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct FaultInjector {
    faults: Mutex<BTreeMap<String, Fault>>,
    calls: Mutex<BTreeMap<String, usize>>,
    latency: Mutex<Duration>,
}

impl FaultInjector {
    async fn enter(&self, system: &str, operation: &str) -> Result<()> {
        *self.calls.lock().entry(operation.to_string()).or_default() += 1;

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        let mode = match faults.get_mut(operation) {
            Some(fault) => match fault.remaining {
                None => Some(fault.mode),
                Some(0) => None,
                Some(n) => {
                    fault.remaining = Some(n - 1);
                    Some(fault.mode)
                }
            },
            None => None,
        };
        match mode {
            Some(mode) => Err(mode.to_error(system, operation)),
            None => Ok(()),
        }
    }

    fn set(&self, operation: &str, mode: FailureMode, remaining: Option<u32>) {
        self.faults
            .lock()
            .insert(operation.to_string(), Fault { mode, remaining });
    }

    fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }
}

macro_rules! fault_controls {
    () => {
        /// Fail every call to `operation`
        pub fn fail_always(&self, operation: &str, mode: FailureMode) {
            self.faults.set(operation, mode, None);
        }

        /// Fail the next `times` calls to `operation`
        pub fn fail_times(&self, operation: &str, mode: FailureMode, times: u32) {
            self.faults.set(operation, mode, Some(times));
        }

        pub fn clear_failures(&self) {
            self.faults.faults.lock().clear();
        }

        /// Delay every call by `latency`
        pub fn set_latency(&self, latency: Duration) {
            *self.faults.latency.lock() = latency;
        }

        /// Number of calls made to `operation`
        pub fn calls(&self, operation: &str) -> usize {
            self.faults.calls(operation)
        }
    };
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// Fake Kubernetes cluster
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    volumes: RwLock<Vec<ResourceIdentity>>,
    claims: RwLock<Vec<ResourceIdentity>>,
    snapshots: RwLock<Vec<ResourceIdentity>>,
    driver: RwLock<DriverHealth>,
    faults: FaultInjector,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&self, volume: ResourceIdentity) {
        self.volumes.write().push(volume);
    }

    pub fn add_claim(&self, claim: ResourceIdentity) {
        self.claims.write().push(claim);
    }

    pub fn add_snapshot(&self, snapshot: ResourceIdentity) {
        self.snapshots.write().push(snapshot);
    }

    pub fn set_driver_health(&self, health: DriverHealth) {
        *self.driver.write() = health;
    }

    pub fn remove_volume(&self, name: &str) {
        self.volumes.write().retain(|v| v.name != name);
    }

    fault_controls!();
}

fn in_namespace(items: &[ResourceIdentity], namespace: Option<&str>) -> Vec<ResourceIdentity> {
    items
        .iter()
        .filter(|r| namespace.map_or(true, |ns| r.namespace.as_deref() == Some(ns)))
        .cloned()
        .collect()
}

#[async_trait]
impl ClusterGateway for InMemoryCluster {
    async fn list_volumes(&self) -> Result<Vec<ResourceIdentity>> {
        self.faults.enter("kubernetes", "list_volumes").await?;
        Ok(self.volumes.read().clone())
    }

    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<ResourceIdentity>> {
        self.faults.enter("kubernetes", "list_claims").await?;
        Ok(in_namespace(&self.claims.read(), namespace))
    }

    async fn list_snapshots(&self, namespace: Option<&str>) -> Result<Vec<ResourceIdentity>> {
        self.faults.enter("kubernetes", "list_snapshots").await?;
        Ok(in_namespace(&self.snapshots.read(), namespace))
    }

    async fn driver_health(&self) -> Result<DriverHealth> {
        self.faults.enter("kubernetes", "driver_health").await?;
        Ok(self.driver.read().clone())
    }

    async fn test_connection(&self) -> Result<()> {
        self.faults.enter("kubernetes", "test_connection").await
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// Fake TrueNAS backend
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    volumes: RwLock<Vec<BackendEntity>>,
    snapshots: RwLock<Vec<BackendEntity>>,
    pools: RwLock<Vec<PoolInfo>>,
    faults: FaultInjector,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&self, volume: BackendEntity) {
        self.volumes.write().push(volume);
    }

    pub fn add_snapshot(&self, snapshot: BackendEntity) {
        self.snapshots.write().push(snapshot);
    }

    pub fn add_pool(&self, pool: PoolInfo) {
        self.pools.write().push(pool);
    }

    pub fn remove_volume(&self, full_name: &str) {
        self.volumes.write().retain(|v| v.full_name != full_name);
    }

    fault_controls!();
}

#[async_trait]
impl BackendGateway for InMemoryBackend {
    async fn list_volumes(&self) -> Result<Vec<BackendEntity>> {
        self.faults.enter("truenas", "list_volumes").await?;
        Ok(self.volumes.read().clone())
    }

    async fn list_snapshots(&self) -> Result<Vec<BackendEntity>> {
        self.faults.enter("truenas", "list_snapshots").await?;
        Ok(self.snapshots.read().clone())
    }

    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        self.faults.enter("truenas", "list_pools").await?;
        Ok(self.pools.read().clone())
    }

    async fn test_connection(&self) -> Result<()> {
        self.faults.enter("truenas", "test_connection").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ResourceKind;
    use assert_matches::assert_matches;
    use chrono::Utc;

    #[tokio::test]
    async fn test_namespace_filter() {
        let cluster = InMemoryCluster::new();
        cluster.add_claim(
            ResourceIdentity::new(ResourceKind::Claim, "a", Utc::now()).with_namespace("apps"),
        );
        cluster.add_claim(
            ResourceIdentity::new(ResourceKind::Claim, "b", Utc::now()).with_namespace("db"),
        );

        assert_eq!(cluster.list_claims(None).await.unwrap().len(), 2);
        let apps = cluster.list_claims(Some("apps")).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "a");
        assert_eq!(cluster.calls("list_claims"), 2);
    }

    #[tokio::test]
    async fn test_fail_times_then_recovers() {
        let backend = InMemoryBackend::new();
        backend.fail_times("list_volumes", FailureMode::Transient, 1);

        assert_matches!(
            backend.list_volumes().await,
            Err(Error::BackendApi { status: 503, .. })
        );
        assert!(backend.list_volumes().await.is_ok());
        assert_eq!(backend.calls("list_volumes"), 2);
    }

    #[tokio::test]
    async fn test_fail_always_until_cleared() {
        let cluster = InMemoryCluster::new();
        cluster.fail_always("list_volumes", FailureMode::Unauthorized);

        for _ in 0..3 {
            assert_matches!(cluster.list_volumes().await, Err(Error::Unauthorized { .. }));
        }
        cluster.clear_failures();
        assert!(cluster.list_volumes().await.is_ok());
    }
}
