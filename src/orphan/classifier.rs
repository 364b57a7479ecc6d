//! Orphan Classifier
//!
//! Pure, deterministic decision of whether a resource is an orphan given
//! its correlation outcome, the configured age thresholds and a reference
//! time. Every rule is gated on age first: nothing younger than its kind's
//! threshold is ever reported.

use crate::config::Thresholds;
use crate::domain::ports::{BackendEntity, BackendKind, ResourceIdentity, ResourceKind, ResourcePhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const REASON_NO_BACKEND_VOLUME: &str = "no corresponding backend volume found";
pub const REASON_NO_BACKEND_HANDLE: &str = "no backend handle recorded";
pub const REASON_RELEASED: &str = "released";
pub const REASON_AVAILABLE_UNBOUND: &str = "available but unbound";
pub const REASON_CLAIM_PENDING: &str = "pending beyond threshold";
pub const REASON_CLAIM_LOST: &str = "bound volume lost";
pub const REASON_CLAIM_VOLUME_MISSING: &str = "bound volume not found";
pub const REASON_NO_BACKEND_SNAPSHOT: &str = "no corresponding backend snapshot";
pub const REASON_BACKEND_SNAPSHOT_UNREFERENCED: &str = "backend snapshot without cluster object";
pub const REASON_BACKEND_VOLUME_UNREFERENCED: &str = "backend volume without cluster volume";

// =============================================================================
// Findings
// =============================================================================

/// What kind of object a finding reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrphanType {
    PersistentVolume,
    PersistentVolumeClaim,
    VolumeSnapshot,
    BackendVolume,
    BackendSnapshot,
}

impl std::fmt::Display for OrphanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrphanType::PersistentVolume => write!(f, "PersistentVolume"),
            OrphanType::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
            OrphanType::VolumeSnapshot => write!(f, "VolumeSnapshot"),
            OrphanType::BackendVolume => write!(f, "BackendVolume"),
            OrphanType::BackendSnapshot => write!(f, "BackendSnapshot"),
        }
    }
}

/// A resource judged orphaned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanFinding {
    pub kind: OrphanType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub age_seconds: u64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub source_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub source_annotations: BTreeMap<String, String>,
}

impl OrphanFinding {
    pub fn age(&self) -> Duration {
        Duration::from_secs(self.age_seconds)
    }

    fn from_identity(identity: &ResourceIdentity, age: Duration, reason: &str) -> Self {
        let kind = match identity.kind {
            ResourceKind::Volume => OrphanType::PersistentVolume,
            ResourceKind::Claim => OrphanType::PersistentVolumeClaim,
            ResourceKind::Snapshot => OrphanType::VolumeSnapshot,
        };
        Self {
            kind,
            name: identity.name.clone(),
            namespace: identity.namespace.clone(),
            created_at: identity.created_at,
            age_seconds: age.as_secs(),
            reason: reason.to_string(),
            size_hint: identity.size_hint.clone(),
            backend_handle: identity.backend_handle.clone(),
            storage_class: identity.storage_class.clone(),
            source_labels: identity.labels.clone(),
            source_annotations: identity.annotations.clone(),
        }
    }

    fn from_entity(
        entity: &BackendEntity,
        kind: OrphanType,
        created_at: DateTime<Utc>,
        age: Duration,
        reason: &str,
    ) -> Self {
        let size = entity.used_bytes.max(entity.size_bytes);
        Self {
            kind,
            name: entity.full_name.clone(),
            namespace: None,
            created_at,
            age_seconds: age.as_secs(),
            reason: reason.to_string(),
            size_hint: (size > 0).then(|| size.to_string()),
            backend_handle: Some(entity.full_name.clone()),
            storage_class: None,
            source_labels: BTreeMap::new(),
            source_annotations: entity.properties.clone(),
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Age of something created at `created_at`, clamped to zero for future timestamps
pub fn age_at(created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - created_at).to_std().unwrap_or(Duration::ZERO)
}

fn threshold_for(kind: ResourceKind, thresholds: &Thresholds) -> Duration {
    match kind {
        ResourceKind::Volume => thresholds.volume_age,
        ResourceKind::Claim => thresholds.claim_age,
        ResourceKind::Snapshot => thresholds.snapshot_age,
    }
}

/// Classify a cluster-side resource.
///
/// `correlated` means: for volumes and snapshots, a backend counterpart was
/// found; for claims, the bound volume exists in the cluster.
pub fn classify(
    identity: &ResourceIdentity,
    correlated: bool,
    thresholds: &Thresholds,
    now: DateTime<Utc>,
) -> Option<OrphanFinding> {
    let age = age_at(identity.created_at, now);
    if age <= threshold_for(identity.kind, thresholds) {
        return None;
    }

    let reason = match identity.kind {
        ResourceKind::Volume => {
            if !correlated {
                if identity.backend_handle.as_deref().map_or(true, str::is_empty) {
                    REASON_NO_BACKEND_HANDLE
                } else {
                    REASON_NO_BACKEND_VOLUME
                }
            } else {
                match identity.phase {
                    ResourcePhase::Released => REASON_RELEASED,
                    ResourcePhase::Available => REASON_AVAILABLE_UNBOUND,
                    _ => return None,
                }
            }
        }
        ResourceKind::Claim => match identity.phase {
            ResourcePhase::Pending => REASON_CLAIM_PENDING,
            ResourcePhase::Lost => REASON_CLAIM_LOST,
            _ if !correlated => REASON_CLAIM_VOLUME_MISSING,
            _ => return None,
        },
        ResourceKind::Snapshot => {
            if correlated {
                return None;
            }
            REASON_NO_BACKEND_SNAPSHOT
        }
    };

    Some(OrphanFinding::from_identity(identity, age, reason))
}

/// Classify a backend volume or snapshot that has no cluster counterpart.
///
/// Entities without a creation time are never reported.
pub fn classify_backend(
    entity: &BackendEntity,
    correlated: bool,
    thresholds: &Thresholds,
    now: DateTime<Utc>,
) -> Option<OrphanFinding> {
    let (kind, threshold, reason) = match entity.kind {
        BackendKind::Volume => (
            OrphanType::BackendVolume,
            thresholds.volume_age,
            REASON_BACKEND_VOLUME_UNREFERENCED,
        ),
        BackendKind::Snapshot => (
            OrphanType::BackendSnapshot,
            thresholds.snapshot_retention,
            REASON_BACKEND_SNAPSHOT_UNREFERENCED,
        ),
        BackendKind::Pool => return None,
    };

    let created_at = entity.created_at?;
    let age = age_at(created_at, now);
    if age <= threshold || correlated {
        return None;
    }

    Some(OrphanFinding::from_entity(entity, kind, created_at, age, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn thresholds() -> Thresholds {
        Thresholds {
            volume_age: Duration::from_secs(24 * 3600),
            claim_age: Duration::from_secs(3600),
            snapshot_age: Duration::from_secs(24 * 3600),
            snapshot_retention: Duration::from_secs(30 * 86400),
        }
    }

    fn created(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
        now - ChronoDuration::hours(hours)
    }

    #[test]
    fn test_young_resources_never_reported() {
        let now = Utc::now();
        let t = thresholds();
        for kind in [ResourceKind::Volume, ResourceKind::Claim, ResourceKind::Snapshot] {
            let identity = ResourceIdentity::new(kind, "young", created(now, 0))
                .with_phase(ResourcePhase::Pending);
            assert!(classify(&identity, false, &t, now).is_none(), "{kind}");
        }

        // Exactly at the threshold is still not orphaned
        let at_threshold = ResourceIdentity::new(ResourceKind::Claim, "c", created(now, 1))
            .with_phase(ResourcePhase::Pending);
        assert!(classify(&at_threshold, false, &t, now).is_none());
    }

    #[test]
    fn test_future_timestamp_clamped() {
        let now = Utc::now();
        let identity =
            ResourceIdentity::new(ResourceKind::Volume, "pv", now + ChronoDuration::hours(5));
        assert_eq!(age_at(identity.created_at, now), Duration::ZERO);
        assert!(classify(&identity, false, &thresholds(), now).is_none());
    }

    #[test]
    fn test_uncorrelated_volume() {
        let now = Utc::now();
        let pv = ResourceIdentity::new(ResourceKind::Volume, "pv-a", created(now, 48))
            .with_handle("tank/k8s/pv-a")
            .with_phase(ResourcePhase::Bound);

        let finding = classify(&pv, false, &thresholds(), now).unwrap();
        assert_eq!(finding.kind, OrphanType::PersistentVolume);
        assert_eq!(finding.reason, REASON_NO_BACKEND_VOLUME);
        assert_eq!(finding.age(), Duration::from_secs(48 * 3600));
        assert_eq!(finding.backend_handle.as_deref(), Some("tank/k8s/pv-a"));

        assert!(classify(&pv, true, &thresholds(), now).is_none());
    }

    #[test]
    fn test_volume_without_handle() {
        let now = Utc::now();
        let pv = ResourceIdentity::new(ResourceKind::Volume, "pv-stuck", created(now, 48));
        let finding = classify(&pv, false, &thresholds(), now).unwrap();
        assert_eq!(finding.reason, REASON_NO_BACKEND_HANDLE);
    }

    #[test]
    fn test_released_and_available_volumes() {
        let now = Utc::now();
        let base = ResourceIdentity::new(ResourceKind::Volume, "pv-r", created(now, 48))
            .with_handle("tank/k8s/pv-r");

        let released = base.clone().with_phase(ResourcePhase::Released);
        assert_eq!(
            classify(&released, true, &thresholds(), now).unwrap().reason,
            REASON_RELEASED
        );

        let available = base.with_phase(ResourcePhase::Available);
        assert_eq!(
            classify(&available, true, &thresholds(), now).unwrap().reason,
            REASON_AVAILABLE_UNBOUND
        );
    }

    #[test]
    fn test_pending_claim() {
        let now = Utc::now();
        let t = thresholds();

        let old = ResourceIdentity::new(ResourceKind::Claim, "c1", created(now, 2))
            .with_namespace("default")
            .with_phase(ResourcePhase::Pending);
        let finding = classify(&old, false, &t, now).unwrap();
        assert_eq!(finding.kind, OrphanType::PersistentVolumeClaim);
        assert_eq!(finding.reason, REASON_CLAIM_PENDING);
        assert_eq!(finding.namespace.as_deref(), Some("default"));

        let young = ResourceIdentity::new(
            ResourceKind::Claim,
            "c1",
            now - ChronoDuration::minutes(30),
        )
        .with_phase(ResourcePhase::Pending);
        assert!(classify(&young, false, &t, now).is_none());
    }

    #[test]
    fn test_lost_and_dangling_claims() {
        let now = Utc::now();
        let t = thresholds();

        let lost = ResourceIdentity::new(ResourceKind::Claim, "c2", created(now, 3))
            .with_phase(ResourcePhase::Lost);
        assert_eq!(classify(&lost, true, &t, now).unwrap().reason, REASON_CLAIM_LOST);

        let bound = ResourceIdentity::new(ResourceKind::Claim, "c3", created(now, 3))
            .with_phase(ResourcePhase::Bound)
            .with_bound_to("pv-gone");
        assert_eq!(
            classify(&bound, false, &t, now).unwrap().reason,
            REASON_CLAIM_VOLUME_MISSING
        );
        assert!(classify(&bound, true, &t, now).is_none());
    }

    #[test]
    fn test_cluster_snapshot() {
        let now = Utc::now();
        let snap = ResourceIdentity::new(ResourceKind::Snapshot, "nightly", created(now, 30))
            .with_namespace("apps");
        let finding = classify(&snap, false, &thresholds(), now).unwrap();
        assert_eq!(finding.kind, OrphanType::VolumeSnapshot);
        assert_eq!(finding.reason, REASON_NO_BACKEND_SNAPSHOT);
        assert!(classify(&snap, true, &thresholds(), now).is_none());
    }

    #[test]
    fn test_backend_snapshot_retention() {
        let now = Utc::now();
        let t = thresholds();

        let old = BackendEntity::snapshot("tank/ds@snap1")
            .with_created_at(now - ChronoDuration::days(40));
        let finding = classify_backend(&old, false, &t, now).unwrap();
        assert_eq!(finding.kind, OrphanType::BackendSnapshot);
        assert_eq!(finding.name, "tank/ds@snap1");
        assert_eq!(finding.reason, "backend snapshot without cluster object");
        assert!(classify_backend(&old, true, &t, now).is_none());

        let recent = BackendEntity::snapshot("tank/ds@snap2")
            .with_created_at(now - ChronoDuration::days(10));
        assert!(classify_backend(&recent, false, &t, now).is_none());

        let undated = BackendEntity::snapshot("tank/ds@snap3");
        assert!(classify_backend(&undated, false, &t, now).is_none());
    }

    #[test]
    fn test_backend_volume() {
        let now = Utc::now();
        let vol = BackendEntity::volume("tank/k8s/volumes/pvc-old")
            .with_created_at(now - ChronoDuration::days(3));
        let finding = classify_backend(&vol, false, &thresholds(), now).unwrap();
        assert_eq!(finding.kind, OrphanType::BackendVolume);
        assert_eq!(finding.reason, REASON_BACKEND_VOLUME_UNREFERENCED);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let now = Utc::now();
        let pv = ResourceIdentity::new(ResourceKind::Volume, "pv-a", created(now, 48))
            .with_handle("tank/k8s/pv-a");
        let first = classify(&pv, false, &thresholds(), now);
        let second = classify(&pv, false, &thresholds(), now);
        assert_eq!(first, second);
    }
}
