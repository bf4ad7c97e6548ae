//! Eviction planning.
//!
//! Selection is greedy oldest-first: candidates are unpinned models in
//! ascending LRU order, cut at the shortest prefix that frees enough bytes.
//! This does not minimise the number of evictions or the bytes freed; it
//! guarantees that the model touched longest ago goes first.

use serde::Serialize;
use tracing::debug;

use super::MemoryLedger;
use crate::handle::ModelHandle;

/// Result of [`MemoryLedger::plan_eviction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictionPlan {
    /// Models to unload, least recently used first.
    pub candidates: Vec<ModelHandle>,
    /// Sum of the candidates' tracked sizes.
    pub freed_bytes: u64,
    /// The amount the plan was asked to free.
    pub required_bytes: u64,
}

impl EvictionPlan {
    /// Whether unloading every candidate frees at least `required_bytes`.
    pub fn is_sufficient(&self) -> bool {
        self.freed_bytes >= self.required_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl MemoryLedger {
    /// Whether loading `additional_bytes` more would exceed the memory limit.
    ///
    /// Always `false` when the limit is `0` (unlimited).
    pub fn needs_eviction(&self, additional_bytes: u64) -> bool {
        let state = self.state.lock();
        state.memory_limit != 0
            && state.total_usage.saturating_add(additional_bytes) > state.memory_limit
    }

    /// Models to unload, oldest first, to free at least `required_bytes`.
    ///
    /// When all unpinned models together cannot free that much, every
    /// unpinned model is returned; callers must check the total themselves
    /// (or use [`plan_eviction`](Self::plan_eviction)).
    pub fn eviction_candidates(&self, required_bytes: u64) -> Vec<ModelHandle> {
        self.plan_eviction(required_bytes).candidates
    }

    /// Like [`eviction_candidates`](Self::eviction_candidates), with the
    /// freed total attached.
    pub fn plan_eviction(&self, required_bytes: u64) -> EvictionPlan {
        self.plan_eviction_where(required_bytes, |_| true)
    }

    /// Like [`plan_eviction`](Self::plan_eviction), restricted to the
    /// unpinned models `eligible` accepts.
    ///
    /// `eligible` runs under the ledger lock and must not call back into
    /// the ledger.
    pub fn plan_eviction_where<F>(&self, required_bytes: u64, eligible: F) -> EvictionPlan
    where
        F: Fn(ModelHandle) -> bool,
    {
        let mut evictable: Vec<_> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter(|(handle, r)| r.is_evictable() && eligible(**handle))
                .map(|(handle, r)| (r.lru_key(), *handle, r.bytes))
                .collect()
        };
        evictable.sort_unstable_by_key(|(key, _, _)| *key);

        let mut plan = EvictionPlan {
            candidates: Vec::new(),
            freed_bytes: 0,
            required_bytes,
        };
        for (_, handle, bytes) in evictable {
            if plan.freed_bytes >= required_bytes {
                break;
            }
            plan.candidates.push(handle);
            plan.freed_bytes = plan.freed_bytes.saturating_add(bytes);
        }

        debug!(
            required_bytes,
            freed_bytes = plan.freed_bytes,
            candidates = plan.candidates.len(),
            sufficient = plan.is_sufficient(),
            "planned eviction"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryManagerConfig;

    const MB: u64 = 1024 * 1024;

    fn h(raw: u64) -> ModelHandle {
        ModelHandle::new(raw)
    }

    fn limited(limit: u64) -> MemoryLedger {
        MemoryLedger::new(MemoryManagerConfig::default().with_memory_limit(limit))
    }

    /// 1 (10MB), 2 (20MB), 3 (30MB); accessed 1, 2, 3, then 3 again.
    fn three_models() -> MemoryLedger {
        let ledger = MemoryLedger::unlimited();
        ledger.track_allocation(h(1), 10 * MB).unwrap();
        ledger.track_allocation(h(2), 20 * MB).unwrap();
        ledger.track_allocation(h(3), 30 * MB).unwrap();
        for raw in 1..=3 {
            ledger.record_access(h(raw));
        }
        ledger.record_access(h(3));
        ledger
    }

    #[test]
    fn test_candidates_smallest_sufficient_prefix() {
        let ledger = three_models();
        assert_eq!(ledger.eviction_candidates(25 * MB), vec![h(1), h(2)]);
        assert_eq!(ledger.eviction_candidates(10 * MB), vec![h(1)]);
        assert_eq!(ledger.eviction_candidates(MB), vec![h(1)]);
    }

    #[test]
    fn test_candidates_follow_access_order() {
        let ledger = three_models();
        ledger.record_access(h(1));
        assert_eq!(ledger.eviction_candidates(25 * MB), vec![h(2), h(3)]);
    }

    #[test]
    fn test_candidates_best_effort_when_insufficient() {
        let ledger = three_models();
        ledger.increment_ref_count(h(2)).unwrap();

        let plan = ledger.plan_eviction(100 * MB);
        assert_eq!(plan.candidates, vec![h(1), h(3)]);
        assert_eq!(plan.freed_bytes, 40 * MB);
        assert!(!plan.is_sufficient());
    }

    #[test]
    fn test_candidates_exclude_pinned() {
        let ledger = three_models();
        let _pin = ledger.pin(h(1)).unwrap();

        let candidates = ledger.eviction_candidates(25 * MB);
        assert_eq!(candidates, vec![h(2), h(3)]);
        assert!(!candidates.contains(&h(1)));
    }

    #[test]
    fn test_zero_required_is_empty_plan() {
        let ledger = three_models();
        let plan = ledger.plan_eviction(0);
        assert!(plan.is_empty());
        assert!(plan.is_sufficient());
    }

    #[test]
    fn test_empty_ledger() {
        let ledger = MemoryLedger::unlimited();
        assert!(ledger.eviction_candidates(MB).is_empty());
    }

    #[test]
    fn test_plan_at_full_range() {
        let ledger = MemoryLedger::unlimited();
        ledger.track_allocation(h(1), u64::MAX - 1).unwrap();
        ledger.track_allocation(h(2), 1).unwrap();

        let plan = ledger.plan_eviction(u64::MAX);
        assert_eq!(plan.candidates, vec![h(1), h(2)]);
        assert_eq!(plan.freed_bytes, u64::MAX);
        assert!(plan.is_sufficient());
    }

    #[test]
    fn test_plan_where_skips_ineligible() {
        let ledger = three_models();

        let plan = ledger.plan_eviction_where(25 * MB, |handle| handle != h(1));
        assert_eq!(plan.candidates, vec![h(2), h(3)]);
        assert_eq!(plan.freed_bytes, 50 * MB);

        let plan = ledger.plan_eviction_where(25 * MB, |handle| handle == h(1));
        assert_eq!(plan.candidates, vec![h(1)]);
        assert!(!plan.is_sufficient());
    }

    #[test]
    fn test_needs_eviction() {
        let ledger = limited(100);
        ledger.track_allocation(h(1), 60).unwrap();

        assert!(!ledger.needs_eviction(40));
        assert!(ledger.needs_eviction(41));
        assert!(ledger.needs_eviction(u64::MAX));
    }

    #[test]
    fn test_needs_eviction_unlimited() {
        let ledger = MemoryLedger::unlimited();
        ledger.track_allocation(h(1), 10 * 1024 * MB).unwrap();
        assert!(!ledger.needs_eviction(u64::MAX));
    }
}
