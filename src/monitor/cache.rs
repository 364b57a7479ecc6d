//! Last-result cache
//!
//! Holds the most recent published [`ScanResult`]. Writers only take the
//! lock for the pointer swap, so readers never wait on a running scan.

use super::result::ScanResult;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Default)]
pub struct LastResultCache {
    slot: RwLock<Option<Arc<ScanResult>>>,
}

impl LastResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent result, if any scan has completed
    pub fn get(&self) -> Option<Arc<ScanResult>> {
        self.slot.read().clone()
    }

    /// Publish `result` unless the same or a newer scan is already cached.
    ///
    /// Returns the shared result when it was accepted.
    pub fn publish(&self, result: ScanResult) -> Option<Arc<ScanResult>> {
        let result = Arc::new(result);
        let mut slot = self.slot.write();
        if slot.as_ref().map_or(false, |cur| cur.scan_id >= result.scan_id) {
            return None;
        }
        *slot = Some(result.clone());
        Some(result)
    }
}
