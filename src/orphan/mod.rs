//! Orphan detection
//!
//! Correlation of cluster handles with backend entities and the pure
//! classification rules applied to the correlation outcome.

pub mod classifier;
pub mod correlator;

pub use classifier::{age_at, classify, classify_backend, OrphanFinding, OrphanType};
pub use correlator::{CorrelationKey, Correlator, KeyStrategy, DEFAULT_STRATEGIES};
