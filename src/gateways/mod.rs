//! Remote resource gateways
//!
//! Adapters implementing the cluster and backend ports, plus the retry
//! decorator every production gateway is wrapped in.

pub mod kubernetes;
pub mod memory;
pub mod retry;
pub mod truenas;

pub use kubernetes::KubeClusterGateway;
pub use memory::{FailureMode, InMemoryBackend, InMemoryCluster};
pub use retry::{Resilient, RetryPolicy};
pub use truenas::TrueNasGateway;
