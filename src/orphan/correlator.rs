//! Identifier Correlator
//!
//! Decides whether a cluster object's backend handle refers to an existing
//! backend entity. Storage drivers encode their handles differently
//! (`iqn.2005-10.org.freenas.ctl:pvc-1`, `tank/k8s/pvc-1`, or a bare name),
//! so a correlation key is extracted with the first applicable strategy
//! from an ordered list and then matched against candidates.

use crate::domain::ports::{BackendEntity, ResourceIdentity};
use tracing::trace;

// =============================================================================
// Key Strategies
// =============================================================================

/// A named rule for turning a backend handle into a correlation key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// iSCSI style handles: text after the last `:`
    ColonSuffix,
    /// Dataset path handles: text after the last `/`
    SlashSuffix,
    /// The handle itself
    Raw,
}

impl KeyStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            KeyStrategy::ColonSuffix => "colon-suffix",
            KeyStrategy::SlashSuffix => "slash-suffix",
            KeyStrategy::Raw => "raw",
        }
    }

    /// Extract a key, or `None` if this strategy does not apply
    pub fn extract<'a>(&self, handle: &'a str) -> Option<&'a str> {
        let key = match self {
            KeyStrategy::ColonSuffix => handle.rsplit_once(':').map(|(_, key)| key),
            KeyStrategy::SlashSuffix => handle.rsplit_once('/').map(|(_, key)| key),
            KeyStrategy::Raw => Some(handle),
        };
        key.filter(|k| !k.is_empty())
    }
}

/// Strategy order used unless overridden
pub const DEFAULT_STRATEGIES: &[KeyStrategy] = &[
    KeyStrategy::ColonSuffix,
    KeyStrategy::SlashSuffix,
    KeyStrategy::Raw,
];

/// Normalized key extracted from a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationKey<'a> {
    pub key: &'a str,
    pub strategy: KeyStrategy,
}

// =============================================================================
// Correlator
// =============================================================================

/// Matches cluster identities against backend entities
#[derive(Debug, Clone)]
pub struct Correlator {
    strategies: Vec<KeyStrategy>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Create a correlator with the default strategy order
    pub fn new() -> Self {
        Self {
            strategies: DEFAULT_STRATEGIES.to_vec(),
        }
    }

    /// Create a correlator with a custom strategy order.
    ///
    /// [`KeyStrategy::Raw`] is appended when missing so extraction stays total.
    pub fn with_strategies(mut strategies: Vec<KeyStrategy>) -> Self {
        if !strategies.contains(&KeyStrategy::Raw) {
            strategies.push(KeyStrategy::Raw);
        }
        Self { strategies }
    }

    pub fn strategies(&self) -> &[KeyStrategy] {
        &self.strategies
    }

    /// Extract the correlation key for a handle. Empty handles have no key.
    pub fn key<'a>(&self, handle: &'a str) -> Option<CorrelationKey<'a>> {
        if handle.is_empty() {
            return None;
        }
        self.strategies.iter().find_map(|strategy| {
            strategy
                .extract(handle)
                .map(|key| CorrelationKey { key, strategy: *strategy })
        })
    }

    /// Whether `identity` has a counterpart among `candidates`
    pub fn correlate(&self, identity: &ResourceIdentity, candidates: &[BackendEntity]) -> bool {
        let handle = match identity.backend_handle.as_deref() {
            Some(h) if !h.is_empty() => h,
            _ => return false,
        };
        let Some(key) = self.key(handle) else {
            return false;
        };
        let matched = candidates.iter().any(|c| matches_candidate(handle, key.key, c));
        trace!(
            handle,
            key = key.key,
            strategy = key.strategy.name(),
            matched,
            "Correlated backend handle"
        );
        matched
    }

    /// Reverse direction: whether a backend entity is referenced by any identity
    pub fn has_cluster_counterpart(
        &self,
        entity: &BackendEntity,
        identities: &[ResourceIdentity],
    ) -> bool {
        identities.iter().any(|identity| {
            self.correlate(identity, std::slice::from_ref(entity))
        })
    }
}

fn matches_candidate(handle: &str, key: &str, candidate: &BackendEntity) -> bool {
    candidate.name == key
        || candidate.name == handle
        || candidate.full_name.contains(key)
        || candidate.dataset_path.contains(key)
        || candidate.properties.values().any(|v| v.contains(key))
}
