//! Scan orchestration
//!
//! The orchestrator state machine, the immutable scan result it produces
//! and the cache holding the latest published result.

pub mod cache;
pub mod orchestrator;
pub mod result;

pub use cache::LastResultCache;
pub use orchestrator::{OrchestratorConfig, ScanOrchestrator, ScanState};
pub use result::{OrphanCounts, ResourceTotals, ScanResult, SubCheck, SubCheckStatus};
