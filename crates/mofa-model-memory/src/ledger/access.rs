//! Access recency tracking for LRU selection.

use tracing::trace;

use super::MemoryLedger;
use crate::handle::ModelHandle;

impl MemoryLedger {
    /// Mark a model as used right now.
    ///
    /// Returns `false` (and does nothing) if the model is not tracked.
    pub fn record_access(&self, handle: ModelHandle) -> bool {
        let mut state = self.state.lock();
        if !state.records.contains_key(&handle) {
            trace!(handle = %handle, "access on untracked model ignored");
            return false;
        }

        let sequence = state.next_sequence();
        if let Some(record) = state.records.get_mut(&handle) {
            record.last_access = sequence;
        }
        true
    }

    /// The least recently used model that is not pinned, if any.
    ///
    /// Ties (only possible when registration and access race) go to the model
    /// registered first.
    pub fn lru_model(&self) -> Option<ModelHandle> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .filter(|(_, r)| r.is_evictable())
            .min_by_key(|(_, r)| r.lru_key())
            .map(|(handle, _)| *handle)
    }
}
