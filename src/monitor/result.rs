//! Scan results
//!
//! The immutable aggregate produced by one scan. Once published it is
//! shared behind an `Arc` and never modified.

use crate::domain::ports::{DriverHealth, PoolInfo};
use crate::orphan::{OrphanFinding, OrphanType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// Sub-checks
// =============================================================================

/// Independent unit of work within a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubCheck {
    Volumes,
    Claims,
    Snapshots,
    PoolUsage,
    DriverHealth,
}

impl SubCheck {
    pub const ALL: [SubCheck; 5] = [
        SubCheck::Volumes,
        SubCheck::Claims,
        SubCheck::Snapshots,
        SubCheck::PoolUsage,
        SubCheck::DriverHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubCheck::Volumes => "volumes",
            SubCheck::Claims => "claims",
            SubCheck::Snapshots => "snapshots",
            SubCheck::PoolUsage => "pool_usage",
            SubCheck::DriverHealth => "driver_health",
        }
    }
}

impl std::fmt::Display for SubCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one sub-check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCheckStatus {
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl SubCheckStatus {
    pub fn succeeded(duration: Duration) -> Self {
        Self {
            succeeded: true,
            error: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failed(error: impl ToString, duration: Duration) -> Self {
        Self {
            succeeded: false,
            error: Some(error.to_string()),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

// =============================================================================
// Scan Result
// =============================================================================

/// Number of objects seen per source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTotals {
    pub volumes: usize,
    pub claims: usize,
    pub snapshots: usize,
    pub backend_volumes: usize,
    pub backend_snapshots: usize,
}

/// Findings per category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCounts {
    pub volumes: usize,
    pub claims: usize,
    pub snapshots: usize,
}

impl OrphanCounts {
    pub fn total(&self) -> usize {
        self.volumes + self.claims + self.snapshots
    }
}

/// Aggregate of one scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// Monotonic scan generation
    pub scan_id: u64,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    /// Cluster volumes and backend volumes without a counterpart
    pub orphaned_volumes: Vec<OrphanFinding>,
    pub orphaned_claims: Vec<OrphanFinding>,
    /// Cluster snapshots and backend snapshots without a counterpart
    pub orphaned_snapshots: Vec<OrphanFinding>,
    pub totals: ResourceTotals,
    pub checks: BTreeMap<SubCheck, SubCheckStatus>,
    #[serde(default)]
    pub pools: Vec<PoolInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_health: Option<DriverHealth>,
    /// Reachability per upstream system at scan start
    #[serde(default)]
    pub connectivity: BTreeMap<String, bool>,
}

impl ScanResult {
    /// An empty result for `scan_id`, filled in by the orchestrator
    pub fn new(scan_id: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            scan_id,
            timestamp,
            duration_ms: 0,
            orphaned_volumes: Vec::new(),
            orphaned_claims: Vec::new(),
            orphaned_snapshots: Vec::new(),
            totals: ResourceTotals::default(),
            checks: BTreeMap::new(),
            pools: Vec::new(),
            driver_health: None,
            connectivity: BTreeMap::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn counts(&self) -> OrphanCounts {
        OrphanCounts {
            volumes: self.orphaned_volumes.len(),
            claims: self.orphaned_claims.len(),
            snapshots: self.orphaned_snapshots.len(),
        }
    }

    /// Whether `check` ran and succeeded
    pub fn check_succeeded(&self, check: SubCheck) -> bool {
        self.checks.get(&check).map_or(false, |s| s.succeeded)
    }

    /// Whether every sub-check succeeded
    pub fn is_complete(&self) -> bool {
        SubCheck::ALL.iter().all(|c| self.check_succeeded(*c))
    }

    pub fn failed_checks(&self) -> Vec<SubCheck> {
        SubCheck::ALL
            .iter()
            .copied()
            .filter(|c| !self.check_succeeded(*c))
            .collect()
    }

    /// All findings of one type
    pub fn findings_of(&self, kind: OrphanType) -> impl Iterator<Item = &OrphanFinding> {
        self.orphaned_volumes
            .iter()
            .chain(&self.orphaned_claims)
            .chain(&self.orphaned_snapshots)
            .filter(move |f| f.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_result_is_incomplete() {
        let result = ScanResult::new(1, Utc::now());
        assert!(!result.is_complete());
        assert_eq!(result.failed_checks().len(), 5);
        assert_eq!(result.counts().total(), 0);
    }

    #[test]
    fn test_check_status() {
        let mut result = ScanResult::new(1, Utc::now());
        for check in SubCheck::ALL {
            result
                .checks
                .insert(check, SubCheckStatus::succeeded(Duration::from_millis(5)));
        }
        assert!(result.is_complete());

        result.checks.insert(
            SubCheck::Claims,
            SubCheckStatus::failed("forbidden", Duration::ZERO),
        );
        assert!(!result.is_complete());
        assert_eq!(result.failed_checks(), vec![SubCheck::Claims]);
        assert_eq!(
            result.checks[&SubCheck::Claims].error.as_deref(),
            Some("forbidden")
        );
    }

    #[test]
    fn test_serializes_check_names() {
        let mut result = ScanResult::new(3, Utc::now());
        result
            .checks
            .insert(SubCheck::PoolUsage, SubCheckStatus::succeeded(Duration::ZERO));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["scanId"], 3);
        assert_eq!(json["checks"]["poolUsage"]["succeeded"], true);
    }
}
