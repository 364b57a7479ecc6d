//! Domain Ports - Core types and trait definitions for the orphan monitor
//!
//! These traits define the boundaries between the correlation/orchestration
//! logic and the two upstream systems (the Kubernetes cluster and the TrueNAS
//! storage backend). Adapters in [`crate::gateways`] implement them.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Cluster Resources
// =============================================================================

/// Kind of a cluster-side storage object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Volume,
    Claim,
    Snapshot,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Claim => write!(f, "claim"),
            ResourceKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Lifecycle phase reported by the cluster for a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePhase {
    Pending,
    Bound,
    Available,
    Released,
    Lost,
    Failed,
    Ready,
    Unknown(String),
}

impl ResourcePhase {
    /// Parse an upstream phase string; unrecognized values are kept verbatim
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pending" => ResourcePhase::Pending,
            "bound" => ResourcePhase::Bound,
            "available" => ResourcePhase::Available,
            "released" => ResourcePhase::Released,
            "lost" => ResourcePhase::Lost,
            "failed" => ResourcePhase::Failed,
            "ready" => ResourcePhase::Ready,
            _ => ResourcePhase::Unknown(s.to_string()),
        }
    }
}

impl std::fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourcePhase::Pending => write!(f, "Pending"),
            ResourcePhase::Bound => write!(f, "Bound"),
            ResourcePhase::Available => write!(f, "Available"),
            ResourcePhase::Released => write!(f, "Released"),
            ResourcePhase::Lost => write!(f, "Lost"),
            ResourcePhase::Failed => write!(f, "Failed"),
            ResourcePhase::Ready => write!(f, "Ready"),
            ResourcePhase::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

/// Snapshot of a cluster-side volume, claim or volume snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Driver handle: CSI volume handle for volumes, snapshot handle for snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_handle: Option<String>,
    pub phase: ResourcePhase,
    /// Claim ref (`ns/name`) for volumes, volume name for claims,
    /// content name for snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ResourceIdentity {
    /// Create an identity with only the required fields populated
    pub fn new(kind: ResourceKind, name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
            created_at,
            backend_handle: None,
            phase: ResourcePhase::Unknown(String::new()),
            bound_to: None,
            size_hint: None,
            storage_class: None,
            driver: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.backend_handle = Some(handle.into());
        self
    }

    pub fn with_phase(mut self, phase: ResourcePhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_bound_to(mut self, bound_to: impl Into<String>) -> Self {
        self.bound_to = Some(bound_to.into());
        self
    }

    /// `namespace/name` for namespaced objects, `name` otherwise
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

// =============================================================================
// Backend Resources
// =============================================================================

/// Kind of a storage backend object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Volume,
    Snapshot,
    Pool,
}

/// A backend dataset, zvol, snapshot or pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendEntity {
    pub kind: BackendKind,
    /// Last path component, or the snapshot name after `@`
    pub name: String,
    /// Full identifier, e.g. `tank/k8s/pvc-1` or `tank/k8s/pvc-1@snap`
    pub full_name: String,
    /// Dataset the entity lives in
    pub dataset_path: String,
    pub size_bytes: u64,
    pub used_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Flattened string properties, including ZFS user properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl BackendEntity {
    /// Build a volume entity from a dataset path such as `tank/k8s/pvc-1`
    pub fn volume(full_name: impl Into<String>) -> Self {
        let full_name = full_name.into();
        let name = full_name
            .rsplit('/')
            .next()
            .unwrap_or(full_name.as_str())
            .to_string();
        Self {
            kind: BackendKind::Volume,
            name,
            dataset_path: full_name.clone(),
            full_name,
            size_bytes: 0,
            used_bytes: 0,
            created_at: None,
            properties: BTreeMap::new(),
        }
    }

    /// Build a snapshot entity from an identifier such as `tank/ds@snap1`
    pub fn snapshot(full_name: impl Into<String>) -> Self {
        let full_name = full_name.into();
        let (dataset_path, name) = match full_name.split_once('@') {
            Some((dataset, snap)) => (dataset.to_string(), snap.to_string()),
            None => (full_name.clone(), full_name.clone()),
        };
        Self {
            kind: BackendKind::Snapshot,
            name,
            full_name,
            dataset_path,
            size_bytes: 0,
            used_bytes: 0,
            created_at: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Whether the entity is a dataset directly below `prefix`
    pub fn is_child_of(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        self.full_name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .map_or(false, |rest| !rest.is_empty() && !rest.contains('/'))
    }

    /// Whether the entity lives at or below `prefix` in the dataset tree
    pub fn is_under(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        self.dataset_path == prefix
            || self
                .dataset_path
                .strip_prefix(prefix)
                .map_or(false, |rest| rest.starts_with('/'))
    }
}

/// Capacity and health of a backend storage pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub name: String,
    pub status: String,
    pub healthy: bool,
    pub size_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
}

impl PoolInfo {
    /// Allocated share of the pool, 0-100
    pub fn utilization_percent(&self) -> f64 {
        if self.size_bytes == 0 {
            return 0.0;
        }
        (self.allocated_bytes as f64 / self.size_bytes as f64) * 100.0
    }
}

// =============================================================================
// CSI Driver Health
// =============================================================================

/// A single CSI driver pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPod {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub ready: bool,
    pub restart_count: i32,
}

impl DriverPod {
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

/// Health of the CSI driver deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverHealth {
    pub driver: String,
    pub pods: Vec<DriverPod>,
}

impl DriverHealth {
    pub fn ready_pods(&self) -> usize {
        self.pods.iter().filter(|p| p.is_running() && p.ready).count()
    }

    pub fn unready_pods(&self) -> usize {
        self.pods.len() - self.ready_pods()
    }

    /// Healthy when at least one pod runs and every running pod is ready
    pub fn healthy(&self) -> bool {
        let running = self.pods.iter().filter(|p| p.is_running()).count();
        running > 0 && running == self.ready_pods()
    }
}

// =============================================================================
// Gateway Ports
// =============================================================================

/// Read-only view of the Kubernetes cluster's storage objects
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// List persistent volumes managed by the monitored CSI drivers
    async fn list_volumes(&self) -> Result<Vec<ResourceIdentity>>;

    /// List persistent volume claims, optionally restricted to a namespace
    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<ResourceIdentity>>;

    /// List volume snapshots joined with their content's snapshot handle
    async fn list_snapshots(&self, namespace: Option<&str>) -> Result<Vec<ResourceIdentity>>;

    /// Inspect the CSI driver pods
    async fn driver_health(&self) -> Result<DriverHealth>;

    /// Verify the API server is reachable with the current credentials
    async fn test_connection(&self) -> Result<()>;

    /// System name used in logs and metrics
    fn system(&self) -> &str {
        "kubernetes"
    }
}

/// Read-only view of the storage backend
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// List datasets and zvols
    async fn list_volumes(&self) -> Result<Vec<BackendEntity>>;

    /// List ZFS snapshots
    async fn list_snapshots(&self) -> Result<Vec<BackendEntity>>;

    /// List storage pools
    async fn list_pools(&self) -> Result<Vec<PoolInfo>>;

    /// Verify the backend API is reachable with the current credentials
    async fn test_connection(&self) -> Result<()>;

    /// System name used in logs and metrics
    fn system(&self) -> &str {
        "truenas"
    }
}

// =============================================================================
// Type Aliases
// =============================================================================

pub type ClusterGatewayRef = Arc<dyn ClusterGateway>;
pub type BackendGatewayRef = Arc<dyn BackendGateway>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parse() {
        assert_eq!(ResourcePhase::parse("Released"), ResourcePhase::Released);
        assert_eq!(ResourcePhase::parse("pending"), ResourcePhase::Pending);
        assert_eq!(
            ResourcePhase::parse("Terminating"),
            ResourcePhase::Unknown("Terminating".into())
        );
    }

    #[test]
    fn test_backend_entity_constructors() {
        let vol = BackendEntity::volume("tank/k8s/pv-a");
        assert_eq!(vol.name, "pv-a");
        assert_eq!(vol.dataset_path, "tank/k8s/pv-a");

        let snap = BackendEntity::snapshot("tank/ds@snap1");
        assert_eq!(snap.name, "snap1");
        assert_eq!(snap.dataset_path, "tank/ds");
        assert_eq!(snap.full_name, "tank/ds@snap1");
    }

    #[test]
    fn test_is_under_prefix() {
        let vol = BackendEntity::volume("tank/k8s/volumes/pvc-1");
        assert!(vol.is_under("tank/k8s/volumes"));
        assert!(vol.is_under("tank/k8s/volumes/"));
        assert!(!vol.is_under("tank/k8s/vol"));
        assert!(!BackendEntity::volume("tank/k8s/volumes").is_under("tank/k8s/volumes/pvc-1"));

        assert!(vol.is_child_of("tank/k8s/volumes"));
        assert!(!BackendEntity::volume("tank/k8s/volumes").is_child_of("tank/k8s/volumes"));
        assert!(!BackendEntity::volume("tank/k8s/volumes/pvc-1/data").is_child_of("tank/k8s/volumes"));
    }

    #[test]
    fn test_pool_utilization() {
        let pool = PoolInfo {
            name: "tank".into(),
            status: "ONLINE".into(),
            healthy: true,
            size_bytes: 1000,
            allocated_bytes: 250,
            free_bytes: 750,
        };
        assert!((pool.utilization_percent() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_driver_health() {
        let pod = |name: &str, phase: &str, ready: bool| DriverPod {
            name: name.into(),
            namespace: "democratic-csi".into(),
            phase: phase.into(),
            ready,
            restart_count: 0,
        };

        let empty = DriverHealth::default();
        assert!(!empty.healthy());

        let healthy = DriverHealth {
            driver: "org.democratic-csi.nfs".into(),
            pods: vec![pod("controller-0", "Running", true), pod("node-a", "Running", true)],
        };
        assert!(healthy.healthy());
        assert_eq!(healthy.unready_pods(), 0);

        let degraded = DriverHealth {
            driver: "org.democratic-csi.nfs".into(),
            pods: vec![pod("controller-0", "Running", true), pod("node-a", "Running", false)],
        };
        assert!(!degraded.healthy());
        assert_eq!(degraded.unready_pods(), 1);
    }
}
