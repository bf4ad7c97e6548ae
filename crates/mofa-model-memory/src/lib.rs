//! # mofa-model-memory
//!
//! Memory ledger and eviction engine for on-device models (LLM, STT, TTS).
//!
//! Inference engines report what they loaded; the ledger tracks sizes, access
//! recency and pin counts, and answers the orchestrator's questions: *is there
//! room for this model?*, *what should go first?*, *are we under pressure?*
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   MemoryLedger                        │
//! │                                                      │
//! │  Allocation ledger  →  Access tracker (LRU order)    │
//! │        ↓                     ↓                       │
//! │  Reference counter  →  Eviction planner              │
//! │        ↓                     ↓                       │
//! │         Pressure monitor → PressureSubscription      │
//! └──────────────────────────────────────────────────────┘
//!               ↑ track / pin / access      ↑ plan / evict
//!          inference engines        ModelLifecycleManager
//! ```
//!
//! The ledger never allocates or frees model memory itself; it only accounts
//! for sizes reported to it and decides what should be freed.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use mofa_model_memory::{MemoryLedger, MemoryManagerConfig, ModelHandle};
//!
//! let config = MemoryManagerConfig::default()
//!     .with_memory_limit(4 * 1024 * 1024 * 1024)
//!     .with_pressure_threshold(0.85)
//!     .unwrap();
//! let ledger = Arc::new(MemoryLedger::new(config));
//!
//! let llm = ModelHandle::new(1);
//! ledger.track_allocation(llm, 2 * 1024 * 1024 * 1024).unwrap();
//!
//! {
//!     let _pin = ledger.pin(llm).unwrap();
//!     ledger.record_access(llm);
//!     // ... run inference; the model cannot be evicted here
//! }
//!
//! assert!(ledger.can_evict(llm));
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod ledger;
pub mod lifecycle;

pub use config::{DEFAULT_PRESSURE_THRESHOLD, MemoryManagerConfig};
pub use error::{ConfigError, LedgerError, LifecycleError};
pub use handle::ModelHandle;
pub use ledger::{
    EvictionPlan, MemoryLedger, MemoryStats, ModelMemoryInfo, PinGuard, PressureEvent,
    PressureSubscription,
};
pub use lifecycle::{ModelEngine, ModelLifecycleManager};
