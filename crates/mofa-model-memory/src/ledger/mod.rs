//! The model memory ledger.
//!
//! One [`MemoryLedger`] per orchestrator, shared as `Arc<MemoryLedger>` with
//! every inference engine. All bookkeeping (the record map, the running total,
//! the access sequence and the last observed pressure state) sits behind a
//! single `parking_lot::Mutex`; every operation is a map lookup plus O(1)
//! arithmetic, so the lock is only ever held for microseconds.
//!
//! The public surface is split by responsibility:
//!
//! - this module: allocation ledger (track / untrack / size queries)
//! - [`access`]: LRU access tracking
//! - [`refcount`]: pinning and [`PinGuard`]
//! - [`eviction`]: eviction planning
//! - [`pressure`]: limit, pressure state and [`PressureSubscription`]
//! - [`stats`]: point-in-time [`MemoryStats`] snapshots

mod access;
mod eviction;
mod pressure;
mod refcount;
mod stats;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{DEFAULT_PRESSURE_THRESHOLD, MemoryManagerConfig};
use crate::error::{ConfigError, LedgerError};
use crate::handle::ModelHandle;

pub use eviction::EvictionPlan;
pub use pressure::{PressureEvent, PressureSubscription};
pub use refcount::PinGuard;
pub use stats::{MemoryStats, ModelMemoryInfo};

use pressure::ListenerSlot;

/// Bookkeeping for one tracked model.
#[derive(Debug, Clone)]
struct AllocationRecord {
    /// Size reported at registration; fixed until deallocation.
    bytes: u64,
    /// Active pins. The record is evictable only at zero.
    ref_count: u32,
    /// Sequence value of the most recent access.
    last_access: u64,
    /// Registration order. Breaks LRU ties and identifies this particular
    /// registration when a handle is reused.
    inserted: u64,
}

impl AllocationRecord {
    fn is_evictable(&self) -> bool {
        self.ref_count == 0
    }

    /// Ordering key for LRU selection; unique per record.
    fn lru_key(&self) -> (u64, u64) {
        (self.last_access, self.inserted)
    }
}

/// Everything guarded by the ledger lock.
#[derive(Debug)]
struct LedgerState {
    records: HashMap<ModelHandle, AllocationRecord>,
    /// Always equal to the sum of `records[*].bytes`; maintained incrementally.
    total_usage: u64,
    /// Shared monotonic access counter.
    sequence: u64,
    insertions: u64,
    memory_limit: u64,
    pressure_threshold: f64,
    /// Pressure state as of the last mutation, for edge detection.
    under_pressure: bool,
}

impl LedgerState {
    fn new(config: &MemoryManagerConfig) -> Self {
        Self {
            records: HashMap::new(),
            total_usage: 0,
            sequence: 0,
            insertions: 0,
            memory_limit: config.memory_limit_bytes,
            pressure_threshold: config.pressure_threshold,
            under_pressure: false,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn is_pressure(&self) -> bool {
        pressure::pressure_reached(self.total_usage, self.memory_limit, self.pressure_threshold)
    }

    /// Re-evaluate pressure after a mutation. Returns an event only on a
    /// false → true edge, so each crossing is reported exactly once.
    fn update_pressure(&mut self) -> Option<PressureEvent> {
        let now = self.is_pressure();
        let crossed = now && !self.under_pressure;
        self.under_pressure = now;
        crossed.then_some(PressureEvent {
            current_usage: self.total_usage,
            limit: self.memory_limit,
        })
    }
}

/// Thread-safe ledger of loaded model memory.
///
/// Engines call [`track_allocation`](Self::track_allocation) after a model
/// load succeeds, [`record_access`](Self::record_access) on every use,
/// [`pin`](Self::pin) around inference, and
/// [`track_deallocation`](Self::track_deallocation) once the model is
/// unloaded. The orchestrator consults
/// [`needs_eviction`](Self::needs_eviction) and
/// [`eviction_candidates`](Self::eviction_candidates) before loading more.
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    listener: Arc<ListenerSlot>,
}

impl MemoryLedger {
    /// Create a ledger from a configuration.
    ///
    /// An out-of-range pressure threshold is replaced by
    /// [`DEFAULT_PRESSURE_THRESHOLD`]; use [`try_new`](Self::try_new) to
    /// reject it instead.
    pub fn new(config: MemoryManagerConfig) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!(error = %e, "invalid memory config, using default pressure threshold");
                MemoryManagerConfig {
                    pressure_threshold: DEFAULT_PRESSURE_THRESHOLD,
                    ..config
                }
            }
        };

        Self {
            state: Mutex::new(LedgerState::new(&config)),
            listener: Arc::new(ListenerSlot::default()),
        }
    }

    /// Create a ledger, rejecting invalid configuration.
    pub fn try_new(config: MemoryManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// A ledger with no memory limit.
    pub fn unlimited() -> Self {
        Self::new(MemoryManagerConfig::default())
    }

    /// Start tracking a freshly loaded model.
    ///
    /// The record starts unpinned and most-recently-used. Registering a
    /// handle that is still tracked, or a size that would overflow the
    /// running total, is rejected and leaves the ledger untouched.
    ///
    /// If this allocation pushes usage across the pressure threshold, the
    /// pressure listener is invoked on this thread before returning.
    pub fn track_allocation(&self, handle: ModelHandle, bytes: u64) -> Result<(), LedgerError> {
        let event = {
            let mut state = self.state.lock();

            if let Some(existing) = state.records.get(&handle) {
                let existing_bytes = existing.bytes;
                warn!(
                    handle = %handle,
                    bytes,
                    existing_bytes,
                    "rejecting allocation for already tracked model"
                );
                return Err(LedgerError::AlreadyTracked {
                    handle,
                    existing_bytes,
                });
            }

            let Some(total_usage) = state.total_usage.checked_add(bytes) else {
                warn!(
                    handle = %handle,
                    bytes,
                    total = state.total_usage,
                    "rejecting allocation that overflows total usage"
                );
                return Err(LedgerError::UsageOverflow {
                    handle,
                    bytes,
                    total_usage: state.total_usage,
                });
            };

            let last_access = state.next_sequence();
            let inserted = state.insertions;
            state.insertions += 1;
            state.records.insert(
                handle,
                AllocationRecord {
                    bytes,
                    ref_count: 0,
                    last_access,
                    inserted,
                },
            );
            state.total_usage = total_usage;

            debug!(handle = %handle, bytes, total = state.total_usage, "tracked allocation");
            state.update_pressure()
        };

        if let Some(event) = event {
            self.notify_pressure(event);
        }
        Ok(())
    }

    /// Stop tracking a model and return the bytes released.
    ///
    /// Unknown handles are a no-op returning `0`, so engines may retry an
    /// unload without double-counting. Pinned models are still removed: once
    /// an engine has unloaded a model its memory is gone regardless of pins.
    pub fn track_deallocation(&self, handle: ModelHandle) -> u64 {
        let mut state = self.state.lock();

        let Some(record) = state.records.remove(&handle) else {
            debug!(handle = %handle, "deallocation of untracked model ignored");
            return 0;
        };

        state.total_usage -= record.bytes;
        if record.ref_count > 0 {
            warn!(
                handle = %handle,
                ref_count = record.ref_count,
                "deallocated model that is still pinned"
            );
        }
        debug!(
            handle = %handle,
            bytes = record.bytes,
            total = state.total_usage,
            "tracked deallocation"
        );

        // Usage only went down; this can clear pressure but never raise it.
        let _ = state.update_pressure();
        record.bytes
    }

    /// Total bytes currently tracked.
    pub fn total_memory_usage(&self) -> u64 {
        self.state.lock().total_usage
    }

    /// Tracked size of one model, `0` if it is not tracked.
    pub fn model_memory_usage(&self, handle: ModelHandle) -> u64 {
        self.state
            .lock()
            .records
            .get(&handle)
            .map_or(0, |r| r.bytes)
    }

    pub fn is_tracked(&self, handle: ModelHandle) -> bool {
        self.state.lock().records.contains_key(&handle)
    }

    /// Number of tracked models.
    pub fn model_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Handles of all tracked models, in no particular order.
    pub fn tracked_handles(&self) -> Vec<ModelHandle> {
        self.state.lock().records.keys().copied().collect()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryLedger")
            .field("models", &state.records.len())
            .field("total_usage", &state.total_usage)
            .field("memory_limit", &state.memory_limit)
            .field("pressure_threshold", &state.pressure_threshold)
            .finish_non_exhaustive()
    }
}
