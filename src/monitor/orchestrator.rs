//! Scan Orchestrator
//!
//! Runs periodic and on-demand scans. A scan probes both upstream systems
//! and runs five independent sub-checks concurrently; each sub-check that
//! fails is recorded in the result and contributes no findings, without
//! aborting the others.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──trigger / tick──► Scanning ──scan finished──► Idle
//!    │                          │
//!    └──────── shutdown ────────┴──────► Stopped (terminal)
//! ```
//!
//! State and scan generation share one `AtomicU64`, so admission of a scan
//! is a single compare-and-swap and at most one scan runs at a time.

use crate::config::{AppConfig, ScanConfig};
use crate::domain::ports::{
    BackendGatewayRef, ClusterGatewayRef, DriverHealth, PoolInfo, ResourceIdentity,
};
use crate::error::{Error, ErrorClass, Result};
use crate::metrics::MetricsSink;
use crate::orphan::{classify, classify_backend, Correlator, OrphanFinding};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::cache::LastResultCache;
use super::result::{ResourceTotals, ScanResult, SubCheck, SubCheckStatus};

// =============================================================================
// Configuration
// =============================================================================

/// Settings the orchestrator needs from the application config
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub scan: ScanConfig,
    /// Backend datasets directly below this prefix are checked for a
    /// cluster counterpart; unset disables the backend volume direction
    pub dataset_prefix: Option<String>,
    /// Drivers whose claims are checked for a missing bound volume
    pub csi_drivers: Vec<String>,
    pub correlator: Correlator,
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            scan: config.scan.clone(),
            dataset_prefix: config
                .truenas
                .dataset_prefix
                .clone()
                .filter(|p| !p.trim_matches('/').is_empty()),
            csi_drivers: config.kubernetes.csi_drivers.clone(),
            correlator: Correlator::default(),
        }
    }
}

// =============================================================================
// State Word
// =============================================================================

const IDLE: u64 = 0;
const SCANNING: u64 = 1;
const STOPPED: u64 = 2;
const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

fn pack(generation: u64, state: u64) -> u64 {
    (generation << STATE_BITS) | state
}

fn unpack(word: u64) -> (u64, u64) {
    (word >> STATE_BITS, word & STATE_MASK)
}

/// Externally visible orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Stopped,
}

enum Admission {
    Started(u64),
    Busy(u64),
    Stopped,
}

/// Resets Scanning to Idle and announces the finished generation, even when
/// the scan future is dropped part-way.
struct ScanGuard<'a> {
    orchestrator: &'a ScanOrchestrator,
    generation: u64,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        // Fails harmlessly when shutdown already moved the word to Stopped
        let _ = self.orchestrator.state.compare_exchange(
            pack(self.generation, SCANNING),
            pack(self.generation, IDLE),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.orchestrator.finished.send_replace(self.generation);
    }
}

type VolumeListing =
    Shared<BoxFuture<'static, std::result::Result<Arc<Vec<ResourceIdentity>>, Arc<Error>>>>;

/// Results of one reconciliation sub-check
#[derive(Debug, Default)]
struct CheckOutcome {
    findings: Vec<OrphanFinding>,
    cluster_total: usize,
    backend_total: usize,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates scans against the cluster and backend gateways
pub struct ScanOrchestrator {
    config: OrchestratorConfig,
    cluster: ClusterGatewayRef,
    backend: BackendGatewayRef,
    metrics: Arc<dyn MetricsSink>,
    cache: LastResultCache,
    state: AtomicU64,
    /// Generation of the most recently finished scan, published or not
    finished: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl ScanOrchestrator {
    /// Create an orchestrator. Fails if the scan configuration is invalid.
    pub fn new(
        config: OrchestratorConfig,
        cluster: ClusterGatewayRef,
        backend: BackendGatewayRef,
        metrics: Arc<dyn MetricsSink>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        config.scan.validate()?;
        let (finished, _) = watch::channel(0);

        Ok(Arc::new(Self {
            config,
            cluster,
            backend,
            metrics,
            cache: LastResultCache::new(),
            state: AtomicU64::new(pack(0, IDLE)),
            finished,
            shutdown,
        }))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self) -> ScanState {
        match unpack(self.state.load(Ordering::Acquire)).1 {
            IDLE => ScanState::Idle,
            SCANNING => ScanState::Scanning,
            _ => ScanState::Stopped,
        }
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Most recently published result. Never blocks on a running scan.
    pub fn last_result(&self) -> Option<Arc<ScanResult>> {
        self.cache.get()
    }

    fn admit(&self) -> Admission {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (generation, state) = unpack(current);
            match state {
                IDLE => {
                    let next = generation + 1;
                    match self.state.compare_exchange_weak(
                        current,
                        pack(next, SCANNING),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Admission::Started(next),
                        Err(actual) => current = actual,
                    }
                }
                SCANNING => return Admission::Busy(generation),
                _ => return Admission::Stopped,
            }
        }
    }

    /// Run a scan now, or join the one already in flight and return its result.
    pub async fn trigger_scan(&self) -> Result<Arc<ScanResult>> {
        match self.admit() {
            Admission::Started(generation) => self.run_admitted(generation).await,
            Admission::Busy(generation) => self.await_generation(generation).await,
            Admission::Stopped => Err(Error::Stopped),
        }
    }

    async fn await_generation(&self, generation: u64) -> Result<Arc<ScanResult>> {
        debug!(generation, "Scan in flight, waiting for its result");
        let mut finished = self.finished.subscribe();
        tokio::select! {
            res = finished.wait_for(|done| *done >= generation) => {
                if res.is_err() {
                    return Err(Error::Internal("scan completion channel closed".into()));
                }
            }
            _ = self.shutdown.cancelled() => return Err(Error::Stopped),
        }

        match self.cache.get() {
            Some(result) if result.scan_id >= generation => Ok(result),
            _ => Err(Error::Cancelled {
                operation: format!("scan {}", generation),
            }),
        }
    }

    async fn run_admitted(&self, generation: u64) -> Result<Arc<ScanResult>> {
        let _guard = ScanGuard {
            orchestrator: self,
            generation,
        };

        let result = self
            .execute_scan(generation)
            .await
            .ok_or_else(|| Error::Cancelled {
                operation: format!("scan {}", generation),
            })?;

        match self.cache.publish(result) {
            Some(published) => {
                self.metrics.record_scan(&published);
                Ok(published)
            }
            None => {
                // A newer scan is already cached; hand that one back
                warn!(generation, "Discarding result older than the cached scan");
                self.cache.get().ok_or_else(|| {
                    Error::Internal("result cache empty after rejected publish".into())
                })
            }
        }
    }

    /// Periodic scan loop. Returns once the orchestrator is stopped.
    pub async fn run(&self) {
        info!(
            interval = %crate::config::format_duration(self.config.scan.interval),
            "Starting periodic scans"
        );

        let mut ticker = tokio::time::interval(self.config.scan.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.admit() {
                Admission::Started(generation) => {
                    if let Err(e) = self.run_admitted(generation).await {
                        match e.class() {
                            ErrorClass::Shutdown => debug!(generation, "Scheduled scan cancelled"),
                            _ => error!(generation, error = %e, "Scheduled scan failed"),
                        }
                    }
                }
                Admission::Busy(generation) => {
                    debug!(generation, "Scan already in flight, skipping tick");
                }
                Admission::Stopped => break,
            }
        }

        info!("Periodic scans stopped");
    }

    /// Stop the orchestrator and wait, up to the grace period, for an
    /// in-flight scan to wind down.
    pub async fn shutdown(&self) {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (generation, state) = unpack(word);
                (state != STOPPED).then(|| pack(generation, STOPPED))
            });
        let Ok(previous) = previous else {
            return;
        };

        info!("Shutting down scan orchestrator");
        self.shutdown.cancel();

        let (generation, state) = unpack(previous);
        if state != SCANNING {
            return;
        }

        let mut finished = self.finished.subscribe();
        let grace = self.config.scan.shutdown_grace;
        let wound_down = tokio::time::timeout(grace, finished.wait_for(|done| *done >= generation))
            .await
            .is_ok();
        if wound_down {
            debug!(generation, "In-flight scan wound down");
        } else {
            warn!(
                generation,
                grace_secs = grace.as_secs(),
                "In-flight scan did not finish within the grace period, abandoning it"
            );
        }
    }

    /// Probe both upstream systems and record their reachability
    pub async fn check_connectivity(&self) -> BTreeMap<String, bool> {
        let connectivity = self.probe(&self.shutdown).await;
        for (system, connected) in &connectivity {
            self.metrics.record_connectivity(system, *connected);
        }
        connectivity
    }

    async fn probe(&self, token: &CancellationToken) -> BTreeMap<String, bool> {
        let (cluster, backend) = tokio::select! {
            res = async { tokio::join!(self.cluster.test_connection(), self.backend.test_connection()) } => res,
            _ = token.cancelled() => {
                let cancelled = || -> Result<()> {
                    Err(Error::Cancelled { operation: "connectivity probe".into() })
                };
                (cancelled(), cancelled())
            }
        };

        let mut connectivity = BTreeMap::new();
        for (system, outcome) in [
            (self.cluster.system(), cluster),
            (self.backend.system(), backend),
        ] {
            if let Err(e) = &outcome {
                if e.class() != ErrorClass::Shutdown {
                    warn!(system, error = %e, "Connectivity check failed");
                }
            }
            connectivity.insert(system.to_string(), outcome.is_ok());
        }
        connectivity
    }

    // =========================================================================
    // Scan Execution
    // =========================================================================

    /// Cluster volumes are listed once per scan and read by both the volume
    /// and the claim check.
    fn list_cluster_volumes(&self) -> VolumeListing {
        let cluster = self.cluster.clone();
        async move { cluster.list_volumes().await.map(Arc::new).map_err(Arc::new) }
            .boxed()
            .shared()
    }

    /// Run one scan. Returns `None` when the scan was cancelled.
    #[instrument(skip(self))]
    async fn execute_scan(&self, generation: u64) -> Option<ScanResult> {
        let token = self.shutdown.child_token();
        let started = Instant::now();
        let now = Utc::now();
        debug!("Scan started");

        let cluster_volumes = self.list_cluster_volumes();
        let (connectivity, volumes, claims, snapshots, pools, driver) = tokio::join!(
            self.probe(&token),
            guarded(
                SubCheck::Volumes,
                &token,
                self.check_volumes(now, cluster_volumes.clone())
            ),
            guarded(
                SubCheck::Claims,
                &token,
                self.check_claims(now, cluster_volumes)
            ),
            guarded(SubCheck::Snapshots, &token, self.check_snapshots(now)),
            guarded(SubCheck::PoolUsage, &token, self.check_pools()),
            guarded(SubCheck::DriverHealth, &token, self.check_driver_health()),
        );

        if token.is_cancelled() {
            info!("Scan cancelled, discarding partial result");
            return None;
        }

        let mut result = ScanResult::new(generation, now);
        result.connectivity = connectivity;
        let mut totals = ResourceTotals::default();

        let (outcome, status) = volumes;
        result.checks.insert(SubCheck::Volumes, status);
        if let Some(outcome) = outcome {
            totals.volumes = outcome.cluster_total;
            totals.backend_volumes = outcome.backend_total;
            result.orphaned_volumes = outcome.findings;
        }

        let (outcome, status) = claims;
        result.checks.insert(SubCheck::Claims, status);
        if let Some(outcome) = outcome {
            totals.claims = outcome.cluster_total;
            result.orphaned_claims = outcome.findings;
        }

        let (outcome, status) = snapshots;
        result.checks.insert(SubCheck::Snapshots, status);
        if let Some(outcome) = outcome {
            totals.snapshots = outcome.cluster_total;
            totals.backend_snapshots = outcome.backend_total;
            result.orphaned_snapshots = outcome.findings;
        }

        let (pools, status) = pools;
        result.checks.insert(SubCheck::PoolUsage, status);
        result.pools = pools.unwrap_or_default();

        let (driver, status) = driver;
        result.checks.insert(SubCheck::DriverHealth, status);
        result.driver_health = driver;

        result.totals = totals;
        sort_findings(&mut result.orphaned_volumes);
        sort_findings(&mut result.orphaned_claims);
        sort_findings(&mut result.orphaned_snapshots);
        result.duration_ms = started.elapsed().as_millis() as u64;

        let counts = result.counts();
        info!(
            orphaned_volumes = counts.volumes,
            orphaned_claims = counts.claims,
            orphaned_snapshots = counts.snapshots,
            failed_checks = result.failed_checks().len(),
            duration_ms = result.duration_ms,
            "Scan completed"
        );

        Some(result)
    }

    fn manages_driver(&self, driver: &str) -> bool {
        self.config.csi_drivers.is_empty() || self.config.csi_drivers.iter().any(|d| d == driver)
    }

    /// Cluster volumes against backend datasets, and datasets directly below
    /// the prefix against cluster volumes.
    async fn check_volumes(
        &self,
        now: DateTime<Utc>,
        volumes: VolumeListing,
    ) -> Result<CheckOutcome> {
        let (volumes, datasets) = tokio::try_join!(
            async { volumes.await.map_err(Error::Shared) },
            self.backend.list_volumes()
        )?;
        let thresholds = &self.config.scan.thresholds;
        let correlator = &self.config.correlator;

        let mut findings: Vec<OrphanFinding> = volumes
            .iter()
            .filter_map(|pv| classify(pv, correlator.correlate(pv, &datasets), thresholds, now))
            .collect();

        if let Some(prefix) = &self.config.dataset_prefix {
            findings.extend(
                datasets
                    .iter()
                    .filter(|ds| ds.is_child_of(prefix))
                    .filter_map(|ds| {
                        let correlated = correlator.has_cluster_counterpart(ds, &volumes);
                        classify_backend(ds, correlated, thresholds, now)
                    }),
            );
        }

        debug!(
            volumes = volumes.len(),
            datasets = datasets.len(),
            findings = findings.len(),
            "Volume check done"
        );
        Ok(CheckOutcome {
            findings,
            cluster_total: volumes.len(),
            backend_total: datasets.len(),
        })
    }

    /// Claims by phase, and bound claims whose volume is gone.
    async fn check_claims(
        &self,
        now: DateTime<Utc>,
        volumes: VolumeListing,
    ) -> Result<CheckOutcome> {
        let namespace = self.config.scan.namespace.as_deref();
        let (claims, volumes) = tokio::join!(self.cluster.list_claims(namespace), volumes);
        let claims = claims?;

        let volume_names: Option<HashSet<&str>> = match &volumes {
            Ok(volumes) => Some(volumes.iter().map(|pv| pv.name.as_str()).collect()),
            Err(e) => {
                warn!(error = %e, "Volume listing failed, checking claims by phase only");
                None
            }
        };

        let thresholds = &self.config.scan.thresholds;
        let findings: Vec<OrphanFinding> = claims
            .iter()
            .filter_map(|pvc| {
                let correlated = self.claim_volume_present(pvc, volume_names.as_ref());
                classify(pvc, correlated, thresholds, now)
            })
            .collect();

        Ok(CheckOutcome {
            findings,
            cluster_total: claims.len(),
            backend_total: 0,
        })
    }

    /// Only claims of a managed driver are judged against the volume list,
    /// since that list holds managed volumes only.
    fn claim_volume_present(
        &self,
        claim: &ResourceIdentity,
        volume_names: Option<&HashSet<&str>>,
    ) -> bool {
        match (volume_names, claim.bound_to.as_deref(), claim.driver.as_deref()) {
            (Some(names), Some(volume), Some(driver)) if self.manages_driver(driver) => {
                names.contains(volume)
            }
            _ => true,
        }
    }

    /// Cluster snapshots against backend snapshots and the reverse.
    async fn check_snapshots(&self, now: DateTime<Utc>) -> Result<CheckOutcome> {
        let namespace = self.config.scan.namespace.as_deref();
        let (snapshots, backend_snapshots) = tokio::try_join!(
            self.cluster.list_snapshots(namespace),
            self.backend.list_snapshots()
        )?;
        let thresholds = &self.config.scan.thresholds;
        let correlator = &self.config.correlator;

        let mut findings: Vec<OrphanFinding> = snapshots
            .iter()
            .filter_map(|vs| {
                classify(vs, correlator.correlate(vs, &backend_snapshots), thresholds, now)
            })
            .collect();

        // A namespace-scoped listing cannot prove a backend snapshot unreferenced
        if namespace.is_none() {
            let prefix = self.config.dataset_prefix.as_deref();
            findings.extend(
                backend_snapshots
                    .iter()
                    .filter(|snap| prefix.map_or(true, |p| snap.is_under(p)))
                    .filter_map(|snap| {
                        let correlated = correlator.has_cluster_counterpart(snap, &snapshots);
                        classify_backend(snap, correlated, thresholds, now)
                    }),
            );
        }

        Ok(CheckOutcome {
            findings,
            cluster_total: snapshots.len(),
            backend_total: backend_snapshots.len(),
        })
    }

    async fn check_pools(&self) -> Result<Vec<PoolInfo>> {
        let pools = self.backend.list_pools().await?;
        let warn_at = self.config.scan.pool_usage_warn_percent;

        for pool in &pools {
            let utilization = pool.utilization_percent();
            if !pool.healthy {
                warn!(pool = %pool.name, status = %pool.status, "Pool is not healthy");
            }
            if utilization > warn_at {
                warn!(
                    pool = %pool.name,
                    utilization_percent = utilization,
                    threshold_percent = warn_at,
                    "Pool utilization above threshold"
                );
            }
        }
        Ok(pools)
    }

    async fn check_driver_health(&self) -> Result<DriverHealth> {
        let health = self.cluster.driver_health().await?;
        if !health.healthy() {
            warn!(
                driver = %health.driver,
                ready = health.ready_pods(),
                unready = health.unready_pods(),
                "CSI driver pods not healthy"
            );
        }
        Ok(health)
    }
}

/// Run one sub-check, racing it against cancellation and recording how it went.
async fn guarded<T, F>(
    check: SubCheck,
    token: &CancellationToken,
    fut: F,
) -> (Option<T>, SubCheckStatus)
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled {
            operation: format!("{} check", check),
        }),
        res = fut => res,
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(value) => (Some(value), SubCheckStatus::succeeded(elapsed)),
        Err(e) => {
            log_check_failure(check, &e, elapsed);
            (None, SubCheckStatus::failed(&e, elapsed))
        }
    }
}

fn log_check_failure(check: SubCheck, err: &Error, elapsed: Duration) {
    let elapsed_ms = elapsed.as_millis() as u64;
    match err.class() {
        ErrorClass::Permission => error!(
            check = %check,
            error = %err,
            "Sub-check lacks permission; grant the missing permission to the \
             monitor's service account or API key"
        ),
        ErrorClass::Transient => {
            warn!(check = %check, error = %err, elapsed_ms, "Sub-check failed transiently")
        }
        ErrorClass::Shutdown => debug!(check = %check, "Sub-check cancelled"),
        _ => warn!(check = %check, error = %err, elapsed_ms, "Sub-check failed"),
    }
}

/// Stable report order: kind, then namespace, then name
fn sort_findings(findings: &mut [OrphanFinding]) {
    findings.sort_by(|a, b| {
        (a.kind, &a.namespace, &a.name).cmp(&(b.kind, &b.namespace, &b.name))
    });
}
