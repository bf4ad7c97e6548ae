//! Reference counting ("pinning") of models that are in use.
//!
//! A model with a non-zero count is never offered for eviction. Engines
//! bracket every inference call with an increment/decrement pair, most
//! conveniently through [`MemoryLedger::pin`].

use tracing::{trace, warn};

use super::MemoryLedger;
use crate::error::LedgerError;
use crate::handle::ModelHandle;

impl MemoryLedger {
    /// Pin a model. Returns the new reference count.
    pub fn increment_ref_count(&self, handle: ModelHandle) -> Result<u32, LedgerError> {
        self.adjust_ref_count(handle, None, RefDelta::Increment)
            .map(|(count, _)| count)
    }

    /// Unpin a model. Returns the new reference count.
    ///
    /// Unpinning a model whose count is already zero is rejected; the count
    /// stays at zero.
    pub fn decrement_ref_count(&self, handle: ModelHandle) -> Result<u32, LedgerError> {
        self.adjust_ref_count(handle, None, RefDelta::Decrement)
            .map(|(count, _)| count)
    }

    /// Current pin count, `0` if the model is not tracked.
    pub fn ref_count(&self, handle: ModelHandle) -> u32 {
        self.state
            .lock()
            .records
            .get(&handle)
            .map_or(0, |r| r.ref_count)
    }

    /// Whether the model is tracked and currently unpinned.
    pub fn can_evict(&self, handle: ModelHandle) -> bool {
        self.state
            .lock()
            .records
            .get(&handle)
            .is_some_and(|r| r.is_evictable())
    }

    /// Pin a model for the lifetime of the returned guard.
    ///
    /// ```rust
    /// # use mofa_model_memory::{MemoryLedger, ModelHandle};
    /// let ledger = MemoryLedger::unlimited();
    /// let tts = ModelHandle::new(3);
    /// ledger.track_allocation(tts, 300 << 20).unwrap();
    ///
    /// {
    ///     let _pin = ledger.pin(tts).unwrap();
    ///     assert!(!ledger.can_evict(tts));
    /// }
    /// assert!(ledger.can_evict(tts));
    /// ```
    pub fn pin(&self, handle: ModelHandle) -> Result<PinGuard<'_>, LedgerError> {
        let (_, generation) = self.adjust_ref_count(handle, None, RefDelta::Increment)?;
        Ok(PinGuard {
            ledger: self,
            handle,
            generation,
        })
    }

    /// Apply a delta under the lock. With `generation` set, only the record
    /// from that registration is touched, so a guard outliving its model
    /// cannot unpin a later model registered under the same handle.
    fn adjust_ref_count(
        &self,
        handle: ModelHandle,
        generation: Option<u64>,
        delta: RefDelta,
    ) -> Result<(u32, u64), LedgerError> {
        let mut state = self.state.lock();

        let record = match state.records.get_mut(&handle) {
            Some(r) if generation.is_none_or(|g| g == r.inserted) => r,
            _ => {
                warn!(handle = %handle, ?delta, "reference count change on untracked model");
                return Err(LedgerError::NotTracked(handle));
            }
        };

        match delta {
            RefDelta::Increment => record.ref_count += 1,
            RefDelta::Decrement => {
                if record.ref_count == 0 {
                    warn!(handle = %handle, "reference count decrement below zero");
                    return Err(LedgerError::RefCountUnderflow(handle));
                }
                record.ref_count -= 1;
            }
        }

        trace!(handle = %handle, ref_count = record.ref_count, "reference count changed");
        Ok((record.ref_count, record.inserted))
    }
}

#[derive(Debug, Clone, Copy)]
enum RefDelta {
    Increment,
    Decrement,
}

/// Keeps a model pinned until dropped. Created by [`MemoryLedger::pin`].
#[must_use = "the model is unpinned as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PinGuard<'a> {
    ledger: &'a MemoryLedger,
    handle: ModelHandle,
    generation: u64,
}

impl PinGuard<'_> {
    pub fn handle(&self) -> ModelHandle {
        self.handle
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        // The model may have been deallocated while pinned; that was already
        // logged at deallocation time.
        let _ = self
            .ledger
            .adjust_ref_count(self.handle, Some(self.generation), RefDelta::Decrement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u64) -> ModelHandle {
        ModelHandle::new(raw)
    }

    #[test]
    fn test_increment_decrement() {
        let ledger = MemoryLedger::unlimited();
        ledger.track_allocation(h(1), 100).unwrap();

        assert_eq!(ledger.increment_ref_count(h(1)), Ok(1));
        assert_eq!(ledger.increment_ref_count(h(1)), Ok(2));
        assert!(!ledger.can_evict(h(1)));
        assert_eq!(ledger.decrement_ref_count(h(1)), Ok(1));
        assert_eq!(ledger.decrement_ref_count(h(1)), Ok(0));
        assert!(ledger.can_evict(h(1)));
    }

    #[test]
    fn test_decrement_at_zero_clamps() {
        let ledger = MemoryLedger::unlimited();
        ledger.track_allocation(h(1), 100).unwrap();

        assert_eq!(
            ledger.decrement_ref_count(h(1)),
            Err(LedgerError::RefCountUnderflow(h(1)))
        );
        assert_eq!(ledger.ref_count(h(1)), 0);
        assert!(ledger.can_evict(h(1)));
        assert_eq!(ledger.total_memory_usage(), 100);
    }

    #[test]
    fn test_untracked_handle() {
        let ledger = MemoryLedger::unlimited();
        assert_eq!(
            ledger.increment_ref_count(h(5)),
            Err(LedgerError::NotTracked(h(5)))
        );
        assert_eq!(
            ledger.decrement_ref_count(h(5)),
            Err(LedgerError::NotTracked(h(5)))
        );
        assert_eq!(ledger.ref_count(h(5)), 0);
        assert!(!ledger.can_evict(h(5)));
        assert!(ledger.pin(h(5)).is_err());
    }

    #[test]
    fn test_pin_guard_unpins_on_drop() {
        let ledger = MemoryLedger::unlimited();
        ledger.track_allocation(h(1), 100).unwrap();

        let outer = ledger.pin(h(1)).unwrap();
        {
            let inner = ledger.pin(h(1)).unwrap();
            assert_eq!(inner.handle(), h(1));
            assert_eq!(ledger.ref_count(h(1)), 2);
        }
        assert_eq!(ledger.ref_count(h(1)), 1);
        drop(outer);
        assert_eq!(ledger.ref_count(h(1)), 0);
    }

    #[test]
    fn test_stale_guard_does_not_touch_reused_handle() {
        let ledger = MemoryLedger::unlimited();
        ledger.track_allocation(h(1), 100).unwrap();
        let guard = ledger.pin(h(1)).unwrap();

        ledger.track_deallocation(h(1));
        ledger.track_allocation(h(1), 200).unwrap();
        ledger.increment_ref_count(h(1)).unwrap();

        drop(guard);
        assert_eq!(ledger.ref_count(h(1)), 1);
    }
}
