//! ModelLifecycleManager - load/unload orchestration on top of the ledger
//!
//! Drives model engines through the ledger protocol:
//! - Evicts least-recently-used, unpinned models before a load that would
//!   exceed the memory limit
//! - Tracks the engine's reported footprint once the load succeeds
//! - Pins and records access around every use of a model
//! - Always deallocates after an unload, even when the engine reports failure
//! - Optionally reacts to pressure notifications by evicting in the background
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mofa_model_memory::{MemoryLedger, MemoryManagerConfig, ModelEngine, ModelLifecycleManager};
//!
//! # async fn run(whisper: Arc<dyn ModelEngine>) -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Arc::new(MemoryLedger::new(
//!     MemoryManagerConfig::default().with_memory_limit(3 << 30),
//! ));
//! let manager = ModelLifecycleManager::new(ledger);
//! let _relief = manager.spawn_pressure_relief();
//!
//! let stt = manager.load(whisper).await?;
//! manager.with_model(stt, |engine| async move {
//!     // run transcription; the model stays pinned until this future completes
//!     engine.model_id().len()
//! }).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::handle::ModelHandle;
use crate::ledger::{EvictionPlan, MemoryLedger, PressureSubscription};

/// Convenience alias used throughout this module
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Error type engines report from load/unload
pub type EngineError = Box<dyn std::error::Error + Send + Sync>;

/// An inference engine (LLM, STT, TTS, ...) whose model memory is managed
/// through the ledger.
#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Identifier of the model this engine serves
    fn model_id(&self) -> &str;

    /// Expected footprint in bytes, used to make room before loading
    fn estimated_memory(&self) -> u64;

    /// Load the model into memory
    async fn load(&self) -> std::result::Result<(), EngineError>;

    /// Unload the model from memory
    async fn unload(&self) -> std::result::Result<(), EngineError>;

    /// Actual footprint in bytes once loaded. Defaults to the estimate.
    fn memory_usage(&self) -> u64 {
        self.estimated_memory()
    }
}

/// Shared inner state for ModelLifecycleManager
struct ManagerInner {
    ledger: Arc<MemoryLedger>,
    engines: RwLock<HashMap<ModelHandle, Arc<dyn ModelEngine>>>,
    /// Serialises loads and evictions so two loads cannot plan against the
    /// same free space.
    load_lock: Mutex<()>,
    next_handle: AtomicU64,
}

/// Loads and unloads engines while keeping the ledger authoritative.
///
/// This type is cheaply cloneable; all clones share the same underlying state.
#[derive(Clone)]
pub struct ModelLifecycleManager {
    inner: Arc<ManagerInner>,
    allow_overcommit: bool,
}

impl ModelLifecycleManager {
    pub fn new(ledger: Arc<MemoryLedger>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                ledger,
                engines: RwLock::new(HashMap::new()),
                load_lock: Mutex::new(()),
                next_handle: AtomicU64::new(1),
            }),
            allow_overcommit: false,
        }
    }

    /// Load models even when eviction cannot make enough room.
    pub fn with_overcommit(mut self, allow: bool) -> Self {
        self.allow_overcommit = allow;
        self
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.inner.ledger
    }

    /// Load an engine's model, evicting older models first if needed.
    ///
    /// Loading a model id that is already loaded returns its existing handle
    /// and counts as an access.
    pub async fn load(&self, engine: Arc<dyn ModelEngine>) -> Result<ModelHandle> {
        let _guard = self.inner.load_lock.lock().await;
        let model_id = engine.model_id().to_string();

        if let Some(handle) = self.find(&model_id).await {
            debug!(model_id = %model_id, handle = %handle, "model already loaded");
            self.inner.ledger.record_access(handle);
            return Ok(handle);
        }

        self.make_room(&model_id, engine.estimated_memory()).await?;

        engine
            .load()
            .await
            .map_err(|e| LifecycleError::Backend(e.to_string()))?;

        let handle = ModelHandle::new(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let bytes = engine.memory_usage();
        if let Err(e) = self.inner.ledger.track_allocation(handle, bytes) {
            // The handle was registered on the shared ledger by someone else.
            if let Err(unload_err) = engine.unload().await {
                error!(model_id = %model_id, error = %unload_err, "error unloading untracked model");
            }
            return Err(e.into());
        }
        self.inner.engines.write().await.insert(handle, engine);

        info!(model_id = %model_id, handle = %handle, bytes, "loaded model");
        Ok(handle)
    }

    /// Unload a model. The ledger entry is removed even if the engine fails
    /// to unload cleanly; the error is still returned.
    pub async fn unload(&self, handle: ModelHandle) -> Result<()> {
        let engine = self
            .inner
            .engines
            .write()
            .await
            .remove(&handle)
            .ok_or(LifecycleError::NotFound(handle))?;

        let result = engine.unload().await;
        self.inner.ledger.track_deallocation(handle);

        match result {
            Ok(()) => {
                info!(model_id = engine.model_id(), handle = %handle, "unloaded model");
                Ok(())
            }
            Err(e) => {
                error!(model_id = engine.model_id(), handle = %handle, error = %e, "error unloading model");
                Err(LifecycleError::Backend(e.to_string()))
            }
        }
    }

    /// Run `f` with the engine pinned, recording the access first.
    pub async fn with_model<F, Fut, R>(&self, handle: ModelHandle, f: F) -> Result<R>
    where
        F: FnOnce(Arc<dyn ModelEngine>) -> Fut,
        Fut: Future<Output = R>,
    {
        // Pin before releasing the map lock; `evict` checks pins under the
        // write lock, so a pinned engine cannot be removed from under `f`.
        let (engine, _pin) = {
            let engines = self.inner.engines.read().await;
            let engine = engines
                .get(&handle)
                .cloned()
                .ok_or(LifecycleError::NotFound(handle))?;
            (engine, self.inner.ledger.pin(handle)?)
        };

        self.inner.ledger.record_access(handle);
        Ok(f(engine).await)
    }

    /// Evict least-recently-used models until usage drops back under the
    /// pressure threshold. Returns the evicted handles.
    pub async fn relieve_pressure(&self) -> Vec<ModelHandle> {
        let _guard = self.inner.load_lock.lock().await;
        let ledger = &self.inner.ledger;

        if !ledger.is_memory_pressure() {
            return Vec::new();
        }

        let threshold_bytes = ledger.memory_limit() as f64 * ledger.pressure_threshold();
        let usage = ledger.total_memory_usage();
        let required = (usage as f64 - threshold_bytes).max(0.0).floor() as u64 + 1;

        let plan = self.plan_owned(required).await;
        if !plan.is_sufficient() {
            warn!(
                required,
                freed = plan.freed_bytes,
                "pinned or foreign models prevent relieving memory pressure fully"
            );
        }

        let mut evicted = Vec::with_capacity(plan.candidates.len());
        for handle in plan.candidates {
            if self.evict(handle).await.is_some() {
                evicted.push(handle);
            }
        }
        info!(count = evicted.len(), usage = ledger.total_memory_usage(), "relieved memory pressure");
        evicted
    }

    /// Register a pressure listener that schedules
    /// [`relieve_pressure`](Self::relieve_pressure) on the current Tokio
    /// runtime whenever the ledger crosses its threshold.
    ///
    /// Must be called from within a Tokio runtime. Replaces any pressure
    /// listener already registered on the ledger.
    pub fn spawn_pressure_relief(&self) -> PressureSubscription {
        let runtime = tokio::runtime::Handle::current();
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let allow_overcommit = self.allow_overcommit;

        self.inner.ledger.set_memory_pressure_callback(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            debug!(usage = event.current_usage, limit = event.limit, "scheduling pressure relief");
            let manager = ModelLifecycleManager {
                inner,
                allow_overcommit,
            };
            runtime.spawn(async move {
                manager.relieve_pressure().await;
            });
        })
    }

    /// Handle of the loaded model with this id, if any.
    pub async fn find(&self, model_id: &str) -> Option<ModelHandle> {
        self.inner
            .engines
            .read()
            .await
            .iter()
            .find(|(_, engine)| engine.model_id() == model_id)
            .map(|(handle, _)| *handle)
    }

    pub async fn is_loaded(&self, handle: ModelHandle) -> bool {
        self.inner.engines.read().await.contains_key(&handle)
    }

    /// All loaded models as `(handle, model_id)` pairs.
    pub async fn loaded_models(&self) -> Vec<(ModelHandle, String)> {
        self.inner
            .engines
            .read()
            .await
            .iter()
            .map(|(handle, engine)| (*handle, engine.model_id().to_string()))
            .collect()
    }

    /// Unload every model.
    pub async fn shutdown(&self) {
        info!("ModelLifecycleManager shutting down...");
        let handles: Vec<ModelHandle> = self.inner.engines.read().await.keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.unload(handle).await {
                error!(handle = %handle, error = %e, "error unloading model during shutdown");
            }
        }
        info!("ModelLifecycleManager shutdown complete");
    }

    // Internal methods

    async fn make_room(&self, model_id: &str, required: u64) -> Result<()> {
        let ledger = &self.inner.ledger;
        if !ledger.needs_eviction(required) {
            return Ok(());
        }

        let limit = ledger.memory_limit();
        let usage = ledger.total_memory_usage();
        let to_free = usage.saturating_add(required).saturating_sub(limit);
        let plan = self.plan_owned(to_free).await;

        if !plan.is_sufficient() {
            let available = limit.saturating_sub(usage.saturating_sub(plan.freed_bytes));
            if !self.allow_overcommit {
                warn!(model_id, required, available, "denying load: not enough evictable memory");
                return Err(Self::insufficient(model_id, required, available));
            }
            warn!(model_id, required, available, "overcommitting memory limit");
        }

        let mut freed = 0u64;
        for handle in plan.candidates {
            if let Some(bytes) = self.evict(handle).await {
                freed = freed.saturating_add(bytes);
            }
        }
        debug!(model_id, planned = plan.freed_bytes, freed, "eviction pass finished");

        // Candidates pinned since planning are skipped, and other ledger
        // users may have allocated meanwhile.
        if !self.allow_overcommit && ledger.needs_eviction(required) {
            let available = limit.saturating_sub(ledger.total_memory_usage());
            warn!(model_id, required, available, "denying load: eviction fell short");
            return Err(Self::insufficient(model_id, required, available));
        }
        Ok(())
    }

    /// Eviction plan over the unpinned models this manager loaded. Handles
    /// tracked on the shared ledger by anyone else are never candidates.
    async fn plan_owned(&self, required: u64) -> EvictionPlan {
        let owned: HashSet<ModelHandle> = self.inner.engines.read().await.keys().copied().collect();
        self.inner
            .ledger
            .plan_eviction_where(required, |handle| owned.contains(&handle))
    }

    fn insufficient(model_id: &str, required: u64, available: u64) -> LifecycleError {
        LifecycleError::InsufficientMemory {
            model_id: model_id.to_string(),
            required_bytes: required,
            available_bytes: available,
        }
    }

    /// Unload one model on behalf of the planner. Returns the bytes released,
    /// or `None` if the model was pinned since planning or is no longer
    /// owned by this manager.
    async fn evict(&self, handle: ModelHandle) -> Option<u64> {
        let engine = {
            let mut engines = self.inner.engines.write().await;
            if !self.inner.ledger.can_evict(handle) {
                debug!(handle = %handle, "skipping eviction of pinned model");
                return None;
            }
            engines.remove(&handle)?
        };

        info!(model_id = engine.model_id(), handle = %handle, "evicting model");
        if let Err(e) = engine.unload().await {
            error!(model_id = engine.model_id(), handle = %handle, error = %e, "error evicting model");
        }
        Some(self.inner.ledger.track_deallocation(handle))
    }
}
