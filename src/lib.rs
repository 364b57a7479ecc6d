//! TrueNAS Orphan Monitor
//!
//! Detects storage that has drifted out of sync between a Kubernetes
//! cluster and a TrueNAS backend provisioned through democratic-csi:
//! PersistentVolumes whose dataset is gone, claims stuck pending or bound
//! to a missing volume, VolumeSnapshots without a ZFS snapshot, and ZFS
//! datasets or snapshots no cluster object references.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Scan Orchestrator                           │
//! │   Idle / Scanning / Stopped  ·  single-flight  ·  last-result cache   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  volumes  │  claims  │  snapshots  │  pool usage  │  driver health   │
//! │           └──── Correlator + Classifier (pure) ────┘                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │              Resilient gateways (retry, timeout, cancel)             │
//! │  ┌──────────────────────────┐     ┌──────────────────────────────┐   │
//! │  │  Kubernetes (kube-rs)    │     │  TrueNAS REST API v2.0       │   │
//! │  └──────────────────────────┘     └──────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`monitor`]: Scan orchestration and results
//! - [`orphan`]: Handle correlation and orphan classification
//! - [`gateways`]: Kubernetes, TrueNAS and in-memory gateways
//! - [`domain`]: Core domain types and gateway traits
//! - [`api`]: REST API
//! - [`metrics`]: Prometheus metrics
//! - [`config`]: Configuration loading and validation
//! - [`crd`]: VolumeSnapshot custom resources
//! - [`error`]: Error types and handling

pub mod api;
pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod gateways;
pub mod metrics;
pub mod monitor;
pub mod orphan;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig};

pub use config::{AppConfig, RetryConfig, ScanConfig, Thresholds};

pub use domain::ports::{
    BackendEntity, BackendGateway, BackendGatewayRef, BackendKind, ClusterGateway,
    ClusterGatewayRef, DriverHealth, PoolInfo, ResourceIdentity, ResourceKind, ResourcePhase,
};

pub use error::{Error, ErrorClass, Result};

pub use gateways::{KubeClusterGateway, Resilient, RetryPolicy, TrueNasGateway};

pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};

pub use monitor::{OrchestratorConfig, ScanOrchestrator, ScanResult, ScanState, SubCheck};

pub use orphan::{Correlator, KeyStrategy, OrphanFinding, OrphanType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
