//! Error types for the model memory ledger.
//!
//! Only caller contract violations surface as errors. Queries on unknown
//! handles, double deallocation, and insufficient evictable memory are all
//! valid states and are answered with empty values instead.

use crate::handle::ModelHandle;

/// Contract violations reported by [`MemoryLedger`](crate::MemoryLedger).
///
/// None of these leave the ledger in an inconsistent state: the offending
/// call is rejected (or clamped) and the existing bookkeeping is kept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// `track_allocation` was called for a handle that is still tracked.
    #[error("model {handle} is already tracked with {existing_bytes} bytes")]
    AlreadyTracked {
        handle: ModelHandle,
        existing_bytes: u64,
    },

    /// A reference-count operation targeted a handle the ledger does not know.
    #[error("model {0} is not tracked")]
    NotTracked(ModelHandle),

    /// Tracking `bytes` more would overflow the running total.
    #[error(
        "tracking {bytes} bytes for model {handle} would overflow \
         total usage of {total_usage} bytes"
    )]
    UsageOverflow {
        handle: ModelHandle,
        bytes: u64,
        total_usage: u64,
    },

    /// `decrement_ref_count` was called on a handle whose count is already 0.
    #[error("reference count of model {0} is already zero")]
    RefCountUnderflow(ModelHandle),
}

/// Invalid [`MemoryManagerConfig`](crate::MemoryManagerConfig) values or
/// unreadable configuration sources.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Errors produced by [`ModelLifecycleManager`](crate::ModelLifecycleManager).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LifecycleError {
    /// The ledger rejected a bookkeeping call.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A model engine reported an error during load/unload.
    #[error("backend error: {0}")]
    Backend(String),

    /// Evicting every unpinned model would still not make room.
    #[error(
        "insufficient memory for {model_id}: need {required_bytes} bytes, \
         {available_bytes} available after eviction"
    )]
    InsufficientMemory {
        model_id: String,
        required_bytes: u64,
        available_bytes: u64,
    },

    /// No loaded model is registered under the handle.
    #[error("model not found: {0}")]
    NotFound(ModelHandle),
}
