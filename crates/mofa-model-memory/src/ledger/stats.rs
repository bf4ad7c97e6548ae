//! Point-in-time snapshots of the ledger.

use serde::Serialize;

use super::MemoryLedger;
use crate::handle::ModelHandle;

/// Per-model entry in a [`MemoryStats`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelMemoryInfo {
    pub handle: ModelHandle,
    pub bytes: u64,
    pub ref_count: u32,
    /// Access sequence value; larger means more recently used.
    pub last_access: u64,
}

impl ModelMemoryInfo {
    pub fn is_pinned(&self) -> bool {
        self.ref_count > 0
    }
}

/// Consistent snapshot of the ledger, taken under a single lock acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pressure_threshold: f64,
    pub under_pressure: bool,
    pub usage_percentage: Option<f64>,
    pub pinned_models: usize,
    /// Tracked models, least recently used first.
    pub models: Vec<ModelMemoryInfo>,
}

impl MemoryStats {
    pub fn model_count(&self) -> usize {
        self.models.len()
    }
}

impl MemoryLedger {
    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();

        let mut ordered: Vec<_> = state.records.iter().collect();
        ordered.sort_unstable_by_key(|(_, r)| r.lru_key());

        let models: Vec<ModelMemoryInfo> = ordered
            .into_iter()
            .map(|(handle, r)| ModelMemoryInfo {
                handle: *handle,
                bytes: r.bytes,
                ref_count: r.ref_count,
                last_access: r.last_access,
            })
            .collect();

        MemoryStats {
            total_usage_bytes: state.total_usage,
            memory_limit_bytes: state.memory_limit,
            pressure_threshold: state.pressure_threshold,
            under_pressure: state.is_pressure(),
            usage_percentage: (state.memory_limit != 0)
                .then(|| state.total_usage as f64 / state.memory_limit as f64 * 100.0),
            pinned_models: models.iter().filter(|m| m.is_pinned()).count(),
            models,
        }
    }
}
