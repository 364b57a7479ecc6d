//! Kubernetes Cluster Gateway
//!
//! Implements the `ClusterGateway` port on top of the Kubernetes API:
//! PersistentVolumes provisioned by the monitored CSI drivers,
//! PersistentVolumeClaims, VolumeSnapshots joined with their contents,
//! and the CSI driver pods.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::config::KubernetesConfig;
use crate::crd::{VolumeSnapshot, VolumeSnapshotContent};
use crate::domain::ports::{
    ClusterGateway, DriverHealth, DriverPod, ResourceIdentity, ResourceKind, ResourcePhase,
};
use crate::error::{Error, Result};

const SYSTEM: &str = "kubernetes";

/// Annotations naming the provisioner responsible for a claim
const PROVISIONER_ANNOTATIONS: &[&str] = &[
    "volume.kubernetes.io/storage-provisioner",
    "volume.beta.kubernetes.io/storage-provisioner",
];

/// Kubernetes-backed cluster gateway.
#[derive(Clone)]
pub struct KubeClusterGateway {
    client: Client,
    config: KubernetesConfig,
}

impl KubeClusterGateway {
    /// Create a gateway from an existing client.
    pub fn new(client: Client, config: KubernetesConfig) -> Self {
        Self { client, config }
    }

    /// Create a gateway from the in-cluster or kubeconfig environment.
    pub async fn try_default(config: KubernetesConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    fn driver_name(&self) -> String {
        self.config
            .csi_drivers
            .first()
            .cloned()
            .unwrap_or_else(|| "democratic-csi".to_string())
    }

    async fn list_contents(&self) -> Result<Vec<VolumeSnapshotContent>> {
        let api: Api<VolumeSnapshotContent> = Api::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("VolumeSnapshotContent CRD not installed");
                Ok(Vec::new())
            }
            Err(e) => Err(map_kube_error(e, "list volumesnapshotcontents")),
        }
    }
}

/// Translate RBAC failures into a permission error naming the missing verb.
fn map_kube_error(err: kube::Error, permission: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => Error::Unauthorized {
            system: SYSTEM.to_string(),
            permission: permission.to_string(),
        },
        _ => Error::Kube(err),
    }
}

// =============================================================================
// Conversions
// =============================================================================

/// Whether the volume was provisioned by one of `drivers` (any CSI driver if empty).
fn is_managed(pv: &PersistentVolume, drivers: &[String]) -> bool {
    let driver = pv
        .spec
        .as_ref()
        .and_then(|s| s.csi.as_ref())
        .map(|csi| csi.driver.as_str());
    match driver {
        Some(d) => drivers.is_empty() || drivers.iter().any(|known| known == d),
        None => false,
    }
}

/// Convert a PersistentVolume. Objects missing a name or creation time are skipped.
fn volume_identity(pv: &PersistentVolume) -> Option<ResourceIdentity> {
    let meta = &pv.metadata;
    let name = meta.name.clone()?;
    let created_at = meta.creation_timestamp.as_ref()?.0;

    let mut identity = ResourceIdentity::new(ResourceKind::Volume, name, created_at);
    identity.labels = meta.labels.clone().unwrap_or_default();
    identity.annotations = meta.annotations.clone().unwrap_or_default();
    identity.phase = pv
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(ResourcePhase::parse)
        .unwrap_or(ResourcePhase::Pending);

    if let Some(spec) = &pv.spec {
        if let Some(csi) = &spec.csi {
            identity.backend_handle = Some(csi.volume_handle.clone()).filter(|h| !h.is_empty());
            identity.driver = Some(csi.driver.clone());
        }
        identity.bound_to = spec.claim_ref.as_ref().and_then(|r| match (&r.namespace, &r.name) {
            (Some(ns), Some(name)) => Some(format!("{}/{}", ns, name)),
            (None, Some(name)) => Some(name.clone()),
            _ => None,
        });
        identity.size_hint = spec
            .capacity
            .as_ref()
            .and_then(|c| c.get("storage"))
            .map(|q| q.0.clone());
        identity.storage_class = spec.storage_class_name.clone();
    }

    Some(identity)
}

fn claim_identity(pvc: &PersistentVolumeClaim) -> Option<ResourceIdentity> {
    let meta = &pvc.metadata;
    let name = meta.name.clone()?;
    let created_at = meta.creation_timestamp.as_ref()?.0;

    let mut identity = ResourceIdentity::new(ResourceKind::Claim, name, created_at);
    identity.namespace = meta.namespace.clone();
    identity.labels = meta.labels.clone().unwrap_or_default();
    identity.annotations = meta.annotations.clone().unwrap_or_default();
    identity.driver = PROVISIONER_ANNOTATIONS
        .iter()
        .find_map(|key| identity.annotations.get(*key).cloned());
    identity.phase = pvc
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(ResourcePhase::parse)
        .unwrap_or(ResourcePhase::Pending);

    if let Some(spec) = &pvc.spec {
        identity.bound_to = spec.volume_name.clone().filter(|v| !v.is_empty());
        identity.storage_class = spec.storage_class_name.clone();
        identity.size_hint = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .map(|q| q.0.clone());
    }

    Some(identity)
}

/// Convert a VolumeSnapshot, resolving its handle through `handles`
/// (content name to snapshot handle).
fn snapshot_identity(
    snapshot: &VolumeSnapshot,
    handles: &BTreeMap<String, String>,
) -> Option<ResourceIdentity> {
    let meta = &snapshot.metadata;
    let name = meta.name.clone()?;
    let created_at = meta.creation_timestamp.as_ref()?.0;

    let mut identity = ResourceIdentity::new(ResourceKind::Snapshot, name, created_at);
    identity.namespace = meta.namespace.clone();
    identity.labels = meta.labels.clone().unwrap_or_default();
    identity.annotations = meta.annotations.clone().unwrap_or_default();
    identity.phase = if snapshot.has_error() {
        ResourcePhase::Failed
    } else if snapshot.is_ready() {
        ResourcePhase::Ready
    } else {
        ResourcePhase::Pending
    };
    identity.storage_class = snapshot.spec.volume_snapshot_class_name.clone();
    identity.size_hint = snapshot
        .status
        .as_ref()
        .and_then(|s| s.restore_size.clone());

    if let Some(content) = snapshot.content_name() {
        identity.bound_to = Some(content.to_string());
        identity.backend_handle = handles.get(content).cloned();
    }

    Some(identity)
}

fn driver_pod(pod: &Pod) -> Option<DriverPod> {
    let name = pod.metadata.name.clone()?;
    let status = pod.status.as_ref();
    let containers = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();

    Some(DriverPod {
        name,
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        ready: !containers.is_empty() && containers.iter().all(|c| c.ready),
        restart_count: containers.iter().map(|c| c.restart_count).sum(),
    })
}

// =============================================================================
// Port Implementation
// =============================================================================

#[async_trait]
impl ClusterGateway for KubeClusterGateway {
    #[instrument(skip(self))]
    async fn list_volumes(&self) -> Result<Vec<ResourceIdentity>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, "list persistentvolumes"))?;

        let total = list.items.len();
        let volumes: Vec<_> = list
            .items
            .iter()
            .filter(|pv| is_managed(pv, &self.config.csi_drivers))
            .filter_map(|pv| {
                let identity = volume_identity(pv);
                if identity.is_none() {
                    debug!(name = ?pv.metadata.name, "Skipping malformed PersistentVolume");
                }
                identity
            })
            .collect();

        debug!(total, managed = volumes.len(), "Listed PersistentVolumes");
        Ok(volumes)
    }

    #[instrument(skip(self))]
    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<ResourceIdentity>> {
        let api: Api<PersistentVolumeClaim> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, "list persistentvolumeclaims"))?;

        let claims: Vec<_> = list
            .items
            .iter()
            .filter_map(|pvc| {
                let identity = claim_identity(pvc);
                if identity.is_none() {
                    debug!(name = ?pvc.metadata.name, "Skipping malformed PersistentVolumeClaim");
                }
                identity
            })
            .collect();

        debug!(count = claims.len(), "Listed PersistentVolumeClaims");
        Ok(claims)
    }

    #[instrument(skip(self))]
    async fn list_snapshots(&self, namespace: Option<&str>) -> Result<Vec<ResourceIdentity>> {
        let api: Api<VolumeSnapshot> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let snapshots = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("VolumeSnapshot CRD not installed");
                return Ok(Vec::new());
            }
            Err(e) => return Err(map_kube_error(e, "list volumesnapshots")),
        };

        let handles: BTreeMap<String, String> = self
            .list_contents()
            .await?
            .iter()
            .filter_map(|c| {
                let name = c.metadata.name.clone()?;
                let handle = c.snapshot_handle()?.to_string();
                Some((name, handle))
            })
            .collect();

        let identities: Vec<_> = snapshots
            .iter()
            .filter_map(|s| {
                let identity = snapshot_identity(s, &handles);
                if identity.is_none() {
                    debug!(name = ?s.metadata.name, "Skipping malformed VolumeSnapshot");
                }
                identity
            })
            .collect();

        debug!(
            count = identities.len(),
            contents = handles.len(),
            "Listed VolumeSnapshots"
        );
        Ok(identities)
    }

    #[instrument(skip(self))]
    async fn driver_health(&self) -> Result<DriverHealth> {
        let api: Api<Pod> = match &self.config.driver_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let mut pods: BTreeMap<String, DriverPod> = BTreeMap::new();
        for selector in &self.config.driver_selectors {
            let list = api
                .list(&ListParams::default().labels(selector))
                .await
                .map_err(|e| map_kube_error(e, "list pods"))?;
            for pod in list.items.iter().filter_map(driver_pod) {
                pods.insert(format!("{}/{}", pod.namespace, pod.name), pod);
            }
        }

        let health = DriverHealth {
            driver: self.driver_name(),
            pods: pods.into_values().collect(),
        };
        debug!(
            pods = health.pods.len(),
            ready = health.ready_pods(),
            "Inspected CSI driver pods"
        );
        Ok(health)
    }

    #[instrument(skip(self))]
    async fn test_connection(&self) -> Result<()> {
        let version = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| map_kube_error(e, "get /version"))?;
        debug!(version = %version.git_version, "Kubernetes API reachable");
        Ok(())
    }
}
