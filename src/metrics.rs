//! Metrics Sink
//!
//! The orchestrator reports through the [`MetricsSink`] trait. The
//! Prometheus implementation owns its own `Registry`, so several instances
//! (one per test, or several monitors in one process) never collide.

use crate::domain::ports::DriverHealth;
use crate::error::Result;
use crate::monitor::result::{ScanResult, SubCheck};
use crate::orphan::OrphanType;
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "orphan_monitor";

/// Destination for scan metrics
pub trait MetricsSink: Send + Sync {
    /// Record the outcome of a published scan
    fn record_scan(&self, result: &ScanResult);

    /// Record the reachability of an upstream system
    fn record_connectivity(&self, system: &str, connected: bool);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_scan(&self, _result: &ScanResult) {}
    fn record_connectivity(&self, _system: &str, _connected: bool) {}
}

// =============================================================================
// Prometheus Sink
// =============================================================================

/// Prometheus gauges and counters for the monitor
pub struct PrometheusMetrics {
    registry: Registry,
    orphaned_volumes: Gauge,
    orphaned_claims: Gauge,
    orphaned_snapshots: GaugeVec,
    resources_total: GaugeVec,
    scan_duration: Gauge,
    scan_duration_histogram: HistogramVec,
    last_scan_timestamp: Gauge,
    scans_total: IntCounterVec,
    check_success: GaugeVec,
    connectivity: GaugeVec,
    pool_utilization: GaugeVec,
    pool_healthy: GaugeVec,
    driver_pods: GaugeVec,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl PrometheusMetrics {
    /// Create the metrics and register them in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let orphaned_volumes = Gauge::with_opts(opts(
            "orphaned_volumes",
            "Orphaned persistent volumes and backend volumes found by the last scan",
        ))?;
        let orphaned_claims = Gauge::with_opts(opts(
            "orphaned_claims",
            "Orphaned persistent volume claims found by the last scan",
        ))?;
        let orphaned_snapshots = GaugeVec::new(
            opts(
                "orphaned_snapshots",
                "Orphaned snapshots found by the last scan",
            ),
            &["direction"],
        )?;
        let resources_total = GaugeVec::new(
            opts("resources_total", "Resources seen by the last scan"),
            &["kind"],
        )?;
        let scan_duration = Gauge::with_opts(opts(
            "scan_duration_seconds",
            "Duration of the last scan",
        ))?;
        let scan_duration_histogram = HistogramVec::new(
            HistogramOpts::new("scan_duration_histogram_seconds", "Distribution of scan durations")
                .namespace(NAMESPACE)
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["status"],
        )?;
        let last_scan_timestamp = Gauge::with_opts(opts(
            "last_scan_timestamp_seconds",
            "Unix time of the last published scan",
        ))?;
        let scans_total = IntCounterVec::new(
            opts("scans_total", "Scans published, by completeness"),
            &["status"],
        )?;
        let check_success = GaugeVec::new(
            opts("check_success", "Whether each sub-check succeeded in the last scan"),
            &["check"],
        )?;
        let connectivity = GaugeVec::new(
            opts("system_connectivity", "Upstream reachability (1 connected, 0 not)"),
            &["system"],
        )?;
        let pool_utilization = GaugeVec::new(
            opts("pool_utilization_percent", "Allocated share of each storage pool"),
            &["pool"],
        )?;
        let pool_healthy = GaugeVec::new(
            opts("pool_healthy", "Storage pool health (1 healthy, 0 not)"),
            &["pool"],
        )?;
        let driver_pods = GaugeVec::new(
            opts("csi_driver_pods", "CSI driver pods by readiness"),
            &["driver", "status"],
        )?;

        registry.register(Box::new(orphaned_volumes.clone()))?;
        registry.register(Box::new(orphaned_claims.clone()))?;
        registry.register(Box::new(orphaned_snapshots.clone()))?;
        registry.register(Box::new(resources_total.clone()))?;
        registry.register(Box::new(scan_duration.clone()))?;
        registry.register(Box::new(scan_duration_histogram.clone()))?;
        registry.register(Box::new(last_scan_timestamp.clone()))?;
        registry.register(Box::new(scans_total.clone()))?;
        registry.register(Box::new(check_success.clone()))?;
        registry.register(Box::new(connectivity.clone()))?;
        registry.register(Box::new(pool_utilization.clone()))?;
        registry.register(Box::new(pool_healthy.clone()))?;
        registry.register(Box::new(driver_pods.clone()))?;

        Ok(Self {
            registry,
            orphaned_volumes,
            orphaned_claims,
            orphaned_snapshots,
            resources_total,
            scan_duration,
            scan_duration_histogram,
            last_scan_timestamp,
            scans_total,
            check_success,
            connectivity,
            pool_utilization,
            pool_healthy,
            driver_pods,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub fn orphaned_volumes(&self) -> f64 {
        self.orphaned_volumes.get()
    }

    pub fn orphaned_claims(&self) -> f64 {
        self.orphaned_claims.get()
    }

    pub fn orphaned_snapshots(&self, direction: &str) -> f64 {
        self.orphaned_snapshots.with_label_values(&[direction]).get()
    }

    pub fn connectivity(&self, system: &str) -> f64 {
        self.connectivity.with_label_values(&[system]).get()
    }

    pub fn check_success(&self, check: SubCheck) -> f64 {
        self.check_success.with_label_values(&[check.as_str()]).get()
    }

    pub fn scans_total(&self, status: &str) -> u64 {
        self.scans_total.with_label_values(&[status]).get()
    }

    fn record_driver(&self, health: &DriverHealth) {
        let ready = health.ready_pods() as f64;
        let unready = health.unready_pods() as f64;
        self.driver_pods
            .with_label_values(&[health.driver.as_str(), "ready"])
            .set(ready);
        self.driver_pods
            .with_label_values(&[health.driver.as_str(), "unready"])
            .set(unready);
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_scan(&self, result: &ScanResult) {
        // Failed sub-checks leave the previous value of their gauges in place
        if result.check_succeeded(SubCheck::Volumes) {
            self.orphaned_volumes.set(result.orphaned_volumes.len() as f64);
            self.resources_total
                .with_label_values(&["volume"])
                .set(result.totals.volumes as f64);
            self.resources_total
                .with_label_values(&["backend_volume"])
                .set(result.totals.backend_volumes as f64);
        }
        if result.check_succeeded(SubCheck::Claims) {
            self.orphaned_claims.set(result.orphaned_claims.len() as f64);
            self.resources_total
                .with_label_values(&["claim"])
                .set(result.totals.claims as f64);
        }
        if result.check_succeeded(SubCheck::Snapshots) {
            let backend = result.findings_of(OrphanType::BackendSnapshot).count();
            let cluster = result.orphaned_snapshots.len() - backend;
            self.orphaned_snapshots
                .with_label_values(&["cluster"])
                .set(cluster as f64);
            self.orphaned_snapshots
                .with_label_values(&["backend"])
                .set(backend as f64);
            self.resources_total
                .with_label_values(&["snapshot"])
                .set(result.totals.snapshots as f64);
            self.resources_total
                .with_label_values(&["backend_snapshot"])
                .set(result.totals.backend_snapshots as f64);
        }

        for pool in &result.pools {
            self.pool_utilization
                .with_label_values(&[pool.name.as_str()])
                .set(pool.utilization_percent());
            self.pool_healthy
                .with_label_values(&[pool.name.as_str()])
                .set(flag(pool.healthy));
        }
        if let Some(health) = &result.driver_health {
            self.record_driver(health);
        }

        for check in SubCheck::ALL {
            self.check_success
                .with_label_values(&[check.as_str()])
                .set(flag(result.check_succeeded(check)));
        }
        for (system, connected) in &result.connectivity {
            self.record_connectivity(system, *connected);
        }

        let status = if result.is_complete() { "complete" } else { "partial" };
        let seconds = result.duration().as_secs_f64();
        self.scan_duration.set(seconds);
        self.scan_duration_histogram
            .with_label_values(&[status])
            .observe(seconds);
        self.scans_total.with_label_values(&[status]).inc();
        self.last_scan_timestamp
            .set(result.timestamp.timestamp() as f64);
    }

    fn record_connectivity(&self, system: &str, connected: bool) {
        self.connectivity
            .with_label_values(&[system])
            .set(flag(connected));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::result::SubCheckStatus;
    use crate::orphan::OrphanFinding;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn finding(kind: OrphanType) -> OrphanFinding {
        OrphanFinding {
            kind,
            name: "x".into(),
            namespace: None,
            created_at: Utc::now(),
            age_seconds: 0,
            reason: "test".into(),
            size_hint: None,
            backend_handle: None,
            storage_class: None,
            source_labels: BTreeMap::new(),
            source_annotations: BTreeMap::new(),
        }
    }

    fn result_with(checks: &[(SubCheck, bool)]) -> ScanResult {
        let mut result = ScanResult::new(1, Utc::now());
        for (check, ok) in checks {
            let status = if *ok {
                SubCheckStatus::succeeded(Duration::ZERO)
            } else {
                SubCheckStatus::failed("boom", Duration::ZERO)
            };
            result.checks.insert(*check, status);
        }
        result
    }

    #[test]
    fn test_independent_registries() {
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();

        let mut result = result_with(&[(SubCheck::Volumes, true)]);
        result.orphaned_volumes.push(finding(OrphanType::PersistentVolume));
        a.record_scan(&result);

        assert_eq!(a.orphaned_volumes(), 1.0);
        assert_eq!(b.orphaned_volumes(), 0.0);
    }

    #[test]
    fn test_snapshot_directions() {
        let metrics = PrometheusMetrics::new().unwrap();
        let mut result = result_with(&[(SubCheck::Snapshots, true)]);
        result.orphaned_snapshots.push(finding(OrphanType::VolumeSnapshot));
        result.orphaned_snapshots.push(finding(OrphanType::BackendSnapshot));
        result.orphaned_snapshots.push(finding(OrphanType::BackendSnapshot));
        metrics.record_scan(&result);

        assert_eq!(metrics.orphaned_snapshots("cluster"), 1.0);
        assert_eq!(metrics.orphaned_snapshots("backend"), 2.0);
    }

    #[test]
    fn test_failed_check_keeps_previous_gauge() {
        let metrics = PrometheusMetrics::new().unwrap();

        let mut first = result_with(&[(SubCheck::Claims, true)]);
        first.orphaned_claims.push(finding(OrphanType::PersistentVolumeClaim));
        metrics.record_scan(&first);
        assert_eq!(metrics.orphaned_claims(), 1.0);

        let second = result_with(&[(SubCheck::Claims, false)]);
        metrics.record_scan(&second);
        assert_eq!(metrics.orphaned_claims(), 1.0);
        assert_eq!(metrics.check_success(SubCheck::Claims), 0.0);
        assert_eq!(metrics.scans_total("partial"), 2);
    }

    #[test]
    fn test_encode_text() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_connectivity("truenas", true);
        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("orphan_monitor_system_connectivity{system=\"truenas\"} 1"));
    }
}
